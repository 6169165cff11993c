//! 不同传输的会话接收器

mod websocket;

pub use websocket::{pump, DirectWebSocketSessionSink, MessageFormat, SessionSinkConfig, WebSocketSessionSink};
