//! 会话接收器 trait：桥接器下游的异步推送连接

use crate::bridge::CloseReason;
use crate::error::SinkError;
use bytes::Bytes;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// 异步发送的结果 future，不借用接收器，可以交给独立任务等待
pub type SendFuture = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'static>>;

/// 持久双向连接（如 WebSocket 会话）的发送端
///
/// 实现必须允许并发调用 `send_async`。接收器的生命周期由连接的
/// 所有者管理，桥接器只持有共享引用。
pub trait SessionSink: Send + Sync {
    /// 会话标识，用于日志关联
    fn id(&self) -> &str;

    /// 非阻塞地提交一条消息
    ///
    /// 提交在调用时完成，返回的 future 只用于观察发送结果。
    /// 多条并发发送到达对端的顺序取决于具体传输是否串行化写入。
    fn send_async(&self, payload: Bytes) -> SendFuture;

    /// 发送一条消息并等待传输层接受
    fn send(&self, payload: Bytes) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        self.send_async(payload)
    }

    /// 使用关闭码和原因终止连接
    fn close(&self, reason: CloseReason) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>>;

    /// 检查接收器是否已关闭
    fn is_closed(&self) -> bool {
        false
    }
}

/// 用于共享所有权的 Arc 包装会话接收器
pub type SharedSessionSink = Arc<dyn SessionSink>;

/// 在调用时同步入队，channel 已满时退化为等待入队
///
/// 同步入队保证提交顺序就是 channel 中的顺序；退化路径上
/// 多条等待中的消息之间不再保证顺序。
pub(crate) fn enqueue<M: Send + 'static>(tx: &mpsc::Sender<M>, message: M) -> SendFuture {
    match tx.try_send(message) {
        Ok(()) => Box::pin(future::ready(Ok(()))),
        Err(TrySendError::Closed(_)) => Box::pin(future::ready(Err(SinkError::Closed))),
        Err(TrySendError::Full(message)) => {
            let tx = tx.clone();
            Box::pin(async move { tx.send(message).await.map_err(|_| SinkError::Closed) })
        }
    }
}

/// 通过 channel 发出的会话帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFrame {
    Data(Bytes),
    Close(CloseReason),
}

/// 包装 channel sender 的会话接收器
///
/// 接收端可以连接到任意传输的写入器。
pub struct ChannelSessionSink {
    id: String,
    tx: mpsc::Sender<SessionFrame>,
    closed: AtomicBool,
}

impl ChannelSessionSink {
    /// 使用指定的缓冲区大小创建新的 channel 会话接收器
    pub fn new(id: impl Into<String>, buffer_size: usize) -> (Self, mpsc::Receiver<SessionFrame>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (
            Self {
                id: id.into(),
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

impl SessionSink for ChannelSessionSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_async(&self, payload: Bytes) -> SendFuture {
        if self.closed.load(Ordering::SeqCst) {
            return Box::pin(future::ready(Err(SinkError::Closed)));
        }
        enqueue(&self.tx, SessionFrame::Data(payload))
    }

    fn close(&self, reason: CloseReason) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Err(SinkError::Closed);
            }
            self.tx
                .send(SessionFrame::Close(reason))
                .await
                .map_err(|_| SinkError::Closed)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}
