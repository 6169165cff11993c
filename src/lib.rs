//! ws-stream-bridge: 带背压的流到 WebSocket 会话桥接器
//!
//! 本库提供:
//! - 按需拉取的数据源抽象（Publisher / Subscriber / Subscription）
//! - 一次只请求一个批次的桥接器 [`StreamBridge`]
//! - 上游结束/错误到会话关闭码的映射
//! - 基于 channel 或直接写流的 WebSocket 会话接收器
//!
//! # 功能特性
//!
//! - `ws` (默认): 通过 tokio-tungstenite 支持 WebSocket 会话
//! - `json` (默认): 使用 serde_json 的 [`JsonEncoder`]
//! - `full`: 所有功能
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ws_stream_bridge::{JsonEncoder, SourceError, StreamBridge, StreamPublisher, WebSocketSessionSink};
//!
//! # async fn example() {
//! let batches = futures_util::stream::iter(vec![Ok::<_, SourceError>(vec![1u32, 2, 3])]);
//! let publisher = StreamPublisher::new(batches);
//!
//! let (sink, rx) = WebSocketSessionSink::new("session-1", 64);
//! let bridge = Arc::new(StreamBridge::<u32, _>::new(Arc::new(sink), JsonEncoder::new()));
//!
//! let delivery = bridge.start(&publisher).unwrap();
//! // rx 连接到 WebSocket 写入器，例如 ws_stream_bridge::pump(rx, ws)
//! # drop(rx);
//! delivery.await.unwrap();
//! # }
//! ```

// 核心模块（始终可用）
mod encoder;
mod error;

pub mod bridge;
pub mod sources;

// WebSocket 接收器（可选）
#[cfg(feature = "ws")]
pub mod sinks;

// 核心类型的重导出
pub use bridge::{
    BridgeStats, ChannelSessionSink, CloseCode, CloseReason, Publisher, Schema, SchemaField, SessionFrame,
    SessionSink, SharedSessionSink, StreamBridge, StreamBridgeBuilder, Subscriber, Subscription,
};
pub use encoder::{DisplayEncoder, Encoder, FnEncoder};
pub use error::{EncodeError, PreambleError, SinkError, SourceError};
pub use sources::{DemandSubscription, StreamPublisher};

#[cfg(feature = "json")]
pub use encoder::JsonEncoder;

#[cfg(feature = "ws")]
pub use sinks::{pump, DirectWebSocketSessionSink, MessageFormat, SessionSinkConfig, WebSocketSessionSink};
