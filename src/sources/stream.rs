//! 把批次流包装为按需投递的数据源

use crate::bridge::{Publisher, Schema, Subscriber, Subscription};
use crate::error::SourceError;
use futures_core::Stream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 显式的需求计数器
///
/// 订阅者每请求一个批次计数加一，投递任务每投递一个批次减一。
/// 计数为零时投递任务挂起，上游不会被继续拉取。
#[derive(Debug, Default)]
pub struct DemandSubscription {
    pending: AtomicU64,
    cancelled: AtomicBool,
    notify: Notify,
}

impl DemandSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尚未满足的需求数
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 等待并消耗一个需求单位
    ///
    /// 订阅被取消时返回 false。
    pub async fn acquire(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }

            let pending = self.pending.load(Ordering::SeqCst);
            if pending > 0 {
                if self
                    .pending
                    .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            self.notify.notified().await;
        }
    }

    /// 等待订阅被取消
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

impl Subscription for DemandSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            warn!("Ignoring request for zero batches");
            return;
        }
        if self.is_cancelled() {
            return;
        }

        let mut current = self.pending.load(Ordering::SeqCst);
        loop {
            match self.pending.compare_exchange_weak(
                current,
                current.saturating_add(n),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.notify.notify_one();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }
}

/// 由批次流驱动的数据源
///
/// 只允许一个订阅者。每个需求单位从流中拉取一个批次；流结束时
/// 通知 `on_complete`，流产生错误时通知 `on_error` 并停止。
pub struct StreamPublisher<S> {
    stream: Mutex<Option<S>>,
    schema: Option<Schema>,
}

impl<S> StreamPublisher<S> {
    /// 包装给定的批次流
    pub fn new(stream: S) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            schema: None,
        }
    }

    /// 在第一个批次之前向订阅者投递 schema
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }
}

impl<T, S> Publisher<T> for StreamPublisher<S>
where
    T: Send + 'static,
    S: Stream<Item = Result<Vec<T>, SourceError>> + Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Result<JoinHandle<()>, SourceError> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| SourceError::Other("publisher state poisoned".to_string()))?
            .take()
            .ok_or(SourceError::AlreadySubscribed)?;

        let subscription = Arc::new(DemandSubscription::new());
        Ok(tokio::spawn(deliver(
            stream,
            self.schema.clone(),
            subscriber,
            subscription,
        )))
    }
}

async fn deliver<T, S>(
    stream: S,
    schema: Option<Schema>,
    subscriber: Arc<dyn Subscriber<T>>,
    subscription: Arc<DemandSubscription>,
) where
    S: Stream<Item = Result<Vec<T>, SourceError>> + Send + 'static,
{
    let mut stream = Box::pin(stream);

    if let Some(schema) = schema.as_ref() {
        subscriber.on_schema(schema).await;
    }
    subscriber.on_subscribe(subscription.clone());

    let mut batches_delivered: u64 = 0;
    loop {
        if !subscription.acquire().await {
            debug!(batches_delivered, "Subscription cancelled, stopping delivery");
            return;
        }

        let next = tokio::select! {
            biased;
            _ = subscription.cancelled() => {
                debug!(batches_delivered, "Subscription cancelled while polling upstream");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(batch)) => {
                batches_delivered += 1;
                debug!(batch_size = batch.len(), batches_delivered, "Delivering batch");
                subscriber.on_next(batch);
            }
            Some(Err(e)) => {
                warn!(error = %e, "Upstream failed, stopping delivery");
                subscriber.on_error(e).await;
                return;
            }
            None => {
                debug!(batches_delivered, "Upstream exhausted");
                subscriber.on_complete().await;
                return;
            }
        }
    }
}
