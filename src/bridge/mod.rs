//! 流桥接模块
//!
//! 本模块提供把按需拉取的上游数据源连接到单个异步推送会话的桥接器，
//! 以及两端的 trait 抽象。

mod close;
mod sink;
mod source;

pub use close::{CloseCode, CloseReason, REASON_DONE, REASON_SCHEMA_FAILED, REASON_STREAMS_EXCEPTION};
pub(crate) use sink::enqueue;
pub use sink::{ChannelSessionSink, SendFuture, SessionFrame, SessionSink, SharedSessionSink};
pub use source::{Publisher, Schema, SchemaField, Subscriber, Subscription};

use crate::encoder::Encoder;
use crate::error::{PreambleError, SourceError};
use bytes::Bytes;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 桥接器的运行计数
///
/// 只作为旁路观测数据，状态机从不读取这些计数。
#[derive(Debug, Default)]
pub struct BridgeStats {
    batches_received: AtomicU64,
    items_submitted: AtomicU64,
    encode_failures: AtomicU64,
    send_failures: AtomicU64,
    demand_requests: AtomicU64,
}

impl BridgeStats {
    /// 收到的批次数
    pub fn batches_received(&self) -> u64 {
        self.batches_received.load(Ordering::Relaxed)
    }

    /// 已提交给会话的消息数
    pub fn items_submitted(&self) -> u64 {
        self.items_submitted.load(Ordering::Relaxed)
    }

    /// 编码失败被跳过的数据条数
    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.load(Ordering::Relaxed)
    }

    /// 异步发送失败的消息数
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// 向上游发出的需求次数
    pub fn demand_requests(&self) -> u64 {
        self.demand_requests.load(Ordering::Relaxed)
    }
}

/// 把按需拉取的数据源桥接到单个异步会话的订阅者
///
/// 需求协议严格为“请求一个批次、处理、再请求一个”，任何时刻最多只有
/// 一个未完成的需求，因此无论批次多大，在途工作都被限制在一个批次内。
///
/// 终止信号的映射：
/// - 上游正常结束：以 `NORMAL` 关闭会话，原因 `"done"`
/// - 上游错误：以 `UNEXPECTED_CONDITION` 关闭会话，原因 `"streams exception"`
/// - schema 发送失败：以 `PROTOCOL_ERROR` 关闭会话，原因 `"Unable to send schema"`
///
/// [`close`](Self::close) 只停止需求流，不关闭会话。
///
/// 同一批次内的消息按顺序提交，但对端的到达顺序只有在传输层串行化
/// 写入时才有保证。
pub struct StreamBridge<T, E> {
    sink: SharedSessionSink,
    encoder: E,
    session_id: Arc<str>,
    subscription: OnceLock<Arc<dyn Subscription>>,
    closed: AtomicBool,
    demand_outstanding: AtomicBool,
    preamble_sent: AtomicBool,
    stats: Arc<BridgeStats>,
    runtime: Option<Handle>,
    _item: PhantomData<fn(T)>,
}

impl<T, E> StreamBridge<T, E> {
    /// 创建绑定到给定会话的桥接器
    pub fn new(sink: SharedSessionSink, encoder: E) -> Self {
        let session_id: Arc<str> = Arc::from(sink.id());
        Self::with_session_id(sink, encoder, session_id)
    }

    fn with_session_id(sink: SharedSessionSink, encoder: E, session_id: Arc<str>) -> Self {
        Self {
            sink,
            encoder,
            session_id,
            subscription: OnceLock::new(),
            closed: AtomicBool::new(false),
            demand_outstanding: AtomicBool::new(false),
            preamble_sent: AtomicBool::new(false),
            stats: Arc::new(BridgeStats::default()),
            runtime: Handle::try_current().ok(),
            _item: PhantomData,
        }
    }

    /// 会话标识
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 检查桥接器是否已关闭
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 运行计数
    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// 接收上游的订阅句柄并请求第一个批次
    ///
    /// 只接受第一个句柄，之后的句柄会被立即取消。如果桥接器在订阅
    /// 建立之前已经关闭，句柄同样被取消，且不会发出任何需求。
    pub fn attach_subscription(&self, subscription: Arc<dyn Subscription>) {
        if self.subscription.set(subscription.clone()).is_err() {
            warn!(session_id = %self.session_id, "Bridge already subscribed, cancelling extra subscription");
            subscription.cancel();
            return;
        }

        if self.is_closed() {
            debug!(session_id = %self.session_id, "Bridge closed before subscription, cancelling");
            subscription.cancel();
            return;
        }

        self.request_one();
    }

    /// 处理上游错误：以 `UNEXPECTED_CONDITION` 关闭会话
    pub async fn on_upstream_error(&self, cause: SourceError) {
        if !self.shut_down() {
            debug!(session_id = %self.session_id, error = %cause, "Ignoring upstream error on closed bridge");
            return;
        }

        error!(session_id = %self.session_id, error = %cause, "Error in session");
        self.close_session(CloseReason::streams_exception()).await;
    }

    /// 处理上游正常结束：以 `NORMAL` 关闭会话
    pub async fn on_upstream_complete(&self) {
        if !self.shut_down() {
            debug!(session_id = %self.session_id, "Ignoring completion on closed bridge");
            return;
        }

        debug!(session_id = %self.session_id, "Upstream complete");
        self.close_session(CloseReason::done()).await;
    }

    /// 发送 schema 前导消息并等待传输层接受
    ///
    /// 不受需求协议约束，每个会话最多发送一次。编码或发送失败时以
    /// `PROTOCOL_ERROR` 关闭会话。
    pub async fn send_preamble<P>(&self, preamble: &P)
    where
        P: ?Sized,
        E: Encoder<P>,
    {
        if self.is_closed() {
            debug!(session_id = %self.session_id, "Bridge closed, schema not sent");
            return;
        }

        if self.preamble_sent.swap(true, Ordering::SeqCst) {
            warn!(session_id = %self.session_id, "Schema already sent, ignoring");
            return;
        }

        let failed = match self.try_send_preamble(preamble).await {
            Ok(()) => false,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Error sending schema");
                true
            }
        };

        if failed && self.shut_down() {
            self.close_session(CloseReason::schema_failed()).await;
        }
    }

    async fn try_send_preamble<P>(&self, preamble: &P) -> Result<(), PreambleError>
    where
        P: ?Sized,
        E: Encoder<P>,
    {
        let payload = self.encoder.encode(preamble)?;
        self.sink.send(payload).await?;
        Ok(())
    }

    /// 停止桥接
    ///
    /// 可以在任何上下文中重复调用，包括与正在处理的批次并发。
    /// 只取消上游订阅，不关闭会话；已经提交的发送不会被撤回。
    pub fn close(&self) {
        if self.shut_down() {
            info!(session_id = %self.session_id, "Bridge closed");
        }
    }

    /// [`close`](Self::close) 的别名
    pub fn cancel(&self) {
        self.close();
    }

    /// 进入关闭状态，只有第一次调用返回 true
    fn shut_down(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(subscription) = self.subscription.get() {
            subscription.cancel();
        }
        true
    }

    fn request_one(&self) {
        let Some(subscription) = self.subscription.get() else {
            return;
        };

        if self.is_closed() {
            return;
        }

        if self.demand_outstanding.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.session_id, "Demand already outstanding");
            return;
        }

        self.stats.demand_requests.fetch_add(1, Ordering::Relaxed);
        subscription.request(1);
    }

    async fn close_session(&self, reason: CloseReason) {
        if reason.code.is_error() {
            warn!(session_id = %self.session_id, code = %reason.code, reason = %reason.reason, "Closing session");
        } else {
            debug!(session_id = %self.session_id, code = %reason.code, reason = %reason.reason, "Closing session");
        }
        if let Err(e) = self.sink.close(reason).await {
            warn!(session_id = %self.session_id, error = %e, "Failed to close session");
        }
    }
}

impl<T, E: Encoder<T>> StreamBridge<T, E> {
    /// 处理一个批次
    ///
    /// 逐条编码并异步提交给会话，不等待网络。处理完后如果桥接器仍然
    /// 打开，再请求一个批次。
    ///
    /// 可以在任意线程调用。发送结果在创建桥接器时所在的 tokio 运行时
    /// （或调用线程当前的运行时）上等待；两者都没有时数据记为发送失败。
    pub fn on_batch(&self, batch: Vec<T>) {
        self.demand_outstanding.store(false, Ordering::SeqCst);
        self.stats.batches_received.fetch_add(1, Ordering::Relaxed);

        for item in &batch {
            // 关闭后跳过剩余数据，避免产生大量发送失败日志；
            // 与 close 并不同步，已提交的发送照常完成
            if self.is_closed() {
                break;
            }

            match self.encoder.encode(item) {
                Ok(payload) => self.dispatch(payload),
                Err(e) => {
                    self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(session_id = %self.session_id, error = %e, "Error serializing row");
                }
            }
        }

        if !self.is_closed() {
            self.request_one();
        }
    }

    fn dispatch(&self, payload: Bytes) {
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(session_id = %self.session_id, "No tokio runtime available, message undeliverable");
            return;
        };

        let send = self.sink.send_async(payload);
        self.stats.items_submitted.fetch_add(1, Ordering::Relaxed);

        let session_id = self.session_id.clone();
        let stats = self.stats.clone();
        runtime.spawn(async move {
            if let Err(e) = send.await {
                stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %session_id, error = %e, "Error sending websocket message");
            }
        });
    }
}

impl<T, E> StreamBridge<T, E>
where
    T: Send + 'static,
    E: Encoder<T> + Encoder<Schema> + 'static,
{
    /// 把桥接器注册为数据源唯一的订阅者
    pub fn start<P>(self: &Arc<Self>, publisher: &P) -> Result<JoinHandle<()>, SourceError>
    where
        P: Publisher<T> + ?Sized,
    {
        let subscriber: Arc<dyn Subscriber<T>> = self.clone();
        publisher.subscribe(subscriber)
    }
}

impl<T, E> Subscriber<T> for StreamBridge<T, E>
where
    T: Send + 'static,
    E: Encoder<T> + Encoder<Schema>,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.attach_subscription(subscription);
    }

    fn on_next(&self, batch: Vec<T>) {
        self.on_batch(batch);
    }

    fn on_error(&self, error: SourceError) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.on_upstream_error(error))
    }

    fn on_complete(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.on_upstream_complete())
    }

    fn on_schema<'a>(&'a self, schema: &'a Schema) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.send_preamble(schema))
    }
}

/// 使用流式 API 创建桥接器的构建器
pub struct StreamBridgeBuilder<E> {
    sink: Option<SharedSessionSink>,
    encoder: Option<E>,
    session_id: Option<String>,
    runtime: Option<Handle>,
}

impl<E> StreamBridgeBuilder<E> {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            sink: None,
            encoder: None,
            session_id: None,
            runtime: None,
        }
    }

    /// 设置下游会话
    pub fn sink(mut self, sink: impl SessionSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// 设置共享的下游会话
    pub fn shared_sink(mut self, sink: SharedSessionSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 设置编码器
    pub fn encoder(mut self, encoder: E) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// 覆盖日志中使用的会话标识（默认取会话自身的 id）
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// 设置等待发送结果的运行时（默认取构建时所在的运行时）
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// 构建桥接器
    ///
    /// 如果没有设置会话或编码器则返回 None
    pub fn build<T>(self) -> Option<StreamBridge<T, E>> {
        let sink = self.sink?;
        let encoder = self.encoder?;
        let session_id: Arc<str> = match self.session_id {
            Some(id) => Arc::from(id),
            None => Arc::from(sink.id()),
        };
        let mut bridge = StreamBridge::with_session_id(sink, encoder, session_id);
        if let Some(runtime) = self.runtime {
            bridge.runtime = Some(runtime);
        }
        Some(bridge)
    }
}

impl<E> Default for StreamBridgeBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
