//! WebSocket 会话接收器

use crate::bridge::{enqueue, CloseReason, SendFuture, SessionSink};
use crate::error::SinkError;
use bytes::Bytes;
use futures_sink::Sink;
use futures_util::SinkExt;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

/// WebSocket 消息格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageFormat {
    /// 作为文本消息发送（默认）
    #[default]
    Text,
    /// 作为二进制消息发送
    Binary,
}

/// WebSocket 会话接收器配置
#[derive(Debug, Clone)]
pub struct SessionSinkConfig {
    /// 消息格式
    pub format: MessageFormat,
    /// channel 缓冲区大小（仅用于 channel 接收器）
    pub buffer_size: usize,
}

impl Default for SessionSinkConfig {
    fn default() -> Self {
        Self {
            format: MessageFormat::Text,
            buffer_size: 64,
        }
    }
}

impl SessionSinkConfig {
    /// 设置消息格式
    pub fn format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    /// 设置缓冲区大小
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// 按格式构造 WebSocket 消息，文本格式要求负载是合法的 UTF-8
fn format_message(format: MessageFormat, payload: Bytes) -> Result<Message, SinkError> {
    match format {
        MessageFormat::Text => String::from_utf8(payload.to_vec())
            .map(|text| Message::Text(text.into()))
            .map_err(|e| SinkError::Send(format!("文本消息不是合法的 UTF-8: {}", e))),
        MessageFormat::Binary => Ok(Message::Binary(payload)),
    }
}

/// 发送到 channel 的 WebSocket 会话接收器
///
/// channel 接收端应连接到 WebSocket 写入器，例如 [`pump`]。
/// 消息在提交时同步入队，channel 有空间时顺序与提交顺序一致。
pub struct WebSocketSessionSink {
    id: String,
    tx: mpsc::Sender<Message>,
    config: SessionSinkConfig,
    closed: AtomicBool,
}

impl WebSocketSessionSink {
    /// 使用指定的缓冲区大小创建新的 WebSocket 会话接收器
    pub fn new(id: impl Into<String>, buffer_size: usize) -> (Self, mpsc::Receiver<Message>) {
        Self::with_config(id, SessionSinkConfig::default().buffer_size(buffer_size))
    }

    /// 使用自定义配置创建新的 WebSocket 会话接收器
    pub fn with_config(id: impl Into<String>, config: SessionSinkConfig) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(config.buffer_size);
        (
            Self {
                id: id.into(),
                tx,
                config,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

impl SessionSink for WebSocketSessionSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_async(&self, payload: Bytes) -> SendFuture {
        if self.closed.load(Ordering::SeqCst) {
            return Box::pin(future::ready(Err(SinkError::Closed)));
        }
        match format_message(self.config.format, payload) {
            Ok(message) => enqueue(&self.tx, message),
            Err(e) => Box::pin(future::ready(Err(e))),
        }
    }

    fn close(&self, reason: CloseReason) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Err(SinkError::Closed);
            }
            // 发送关闭帧
            self.tx
                .send(Message::Close(Some(reason.into())))
                .await
                .map_err(|_| SinkError::Closed)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

/// 直接写入 WebSocket 流的会话接收器
///
/// 所有写入通过互斥锁串行化。多条并发提交的消息按获得锁的顺序写出，
/// 不一定等于提交顺序。
pub struct DirectWebSocketSessionSink<S> {
    id: String,
    stream: Arc<Mutex<S>>,
    config: SessionSinkConfig,
    closed: AtomicBool,
}

impl<S> DirectWebSocketSessionSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Send + Unpin + 'static,
{
    /// 包装给定流创建新的直接 WebSocket 会话接收器
    pub fn new(id: impl Into<String>, stream: S) -> Self {
        Self::with_config(id, stream, SessionSinkConfig::default())
    }

    /// 使用自定义配置创建
    pub fn with_config(id: impl Into<String>, stream: S, config: SessionSinkConfig) -> Self {
        Self {
            id: id.into(),
            stream: Arc::new(Mutex::new(stream)),
            config,
            closed: AtomicBool::new(false),
        }
    }
}

impl<S> SessionSink for DirectWebSocketSessionSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Send + Unpin + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn send_async(&self, payload: Bytes) -> SendFuture {
        if self.closed.load(Ordering::SeqCst) {
            return Box::pin(future::ready(Err(SinkError::Closed)));
        }

        let message = match format_message(self.config.format, payload) {
            Ok(message) => message,
            Err(e) => return Box::pin(future::ready(Err(e))),
        };
        let stream = self.stream.clone();
        Box::pin(async move {
            let mut stream = stream.lock().await;
            stream.send(message).await.map_err(SinkError::WebSocket)
        })
    }

    fn close(&self, reason: CloseReason) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Err(SinkError::Closed);
            }

            let mut stream = self.stream.lock().await;
            stream
                .send(Message::Close(Some(reason.into())))
                .await
                .map_err(SinkError::WebSocket)?;
            stream.close().await.map_err(SinkError::WebSocket)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 把 channel 中的消息写入 WebSocket 流
///
/// 写出关闭帧或 channel 结束后关闭流并返回。
pub async fn pump<S>(mut rx: mpsc::Receiver<Message>, mut ws: S) -> Result<(), SinkError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut forwarded: u64 = 0;

    while let Some(message) = rx.recv().await {
        let is_close = message.is_close();
        if let Err(e) = ws.send(message).await {
            warn!(forwarded, error = %e, "Failed to write WebSocket message");
            return Err(SinkError::WebSocket(e));
        }
        if is_close {
            debug!(forwarded, "Close frame written, stopping writer");
            break;
        }
        forwarded += 1;
    }

    ws.close().await?;
    Ok(())
}
