//! ws-stream-bridge 统一错误类型

use thiserror::Error;

/// 单条数据编码失败
///
/// 只影响当前这一条数据：桥接器记录日志后继续处理批次中的下一条。
#[derive(Debug, Error)]
pub enum EncodeError {
    #[cfg(feature = "json")]
    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("无法编码: {0}")]
    Unsupported(String),
}

/// 上游数据源的错误
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("数据源已关闭")]
    Closed,

    #[error("数据源只允许一个订阅者")]
    AlreadySubscribed,

    #[error("上游执行错误: {0}")]
    Upstream(String),

    #[error("其他错误: {0}")]
    Other(String),
}

/// 会话接收器的错误
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("会话已关闭")]
    Closed,

    #[error("发送错误: {0}")]
    Send(String),

    #[cfg(feature = "ws")]
    #[error("WebSocket 错误: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("其他错误: {0}")]
    Other(String),
}

/// 发送 schema 前导消息失败，对会话是致命的
#[derive(Debug, Error)]
pub enum PreambleError {
    #[error("编码错误: {0}")]
    Encode(#[from] EncodeError),

    #[error("发送错误: {0}")]
    Send(#[from] SinkError),
}
