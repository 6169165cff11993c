//! 会话关闭码与关闭原因

use std::fmt;

/// 桥接器终止会话时的原因文本：上游正常结束
pub const REASON_DONE: &str = "done";

/// 桥接器终止会话时的原因文本：上游执行失败
pub const REASON_STREAMS_EXCEPTION: &str = "streams exception";

/// 桥接器终止会话时的原因文本：schema 前导消息发送失败
pub const REASON_SCHEMA_FAILED: &str = "Unable to send schema";

/// 会话关闭码，数值与 RFC 6455 一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 正常关闭 (1000)
    Normal,
    /// 协议错误 (1002)
    ProtocolError,
    /// 遇到意外情况 (1011)
    UnexpectedCondition,
}

impl CloseCode {
    /// 关闭码的数值
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnexpectedCondition => 1011,
        }
    }

    /// 是否表示出错关闭
    pub fn is_error(self) -> bool {
        !matches!(self, CloseCode::Normal)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseCode::Normal => "NORMAL_CLOSURE",
            CloseCode::ProtocolError => "PROTOCOL_ERROR",
            CloseCode::UnexpectedCondition => "UNEXPECTED_CONDITION",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

/// 关闭会话时发送给对端的关闭码和可读原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// 上游正常结束
    pub fn done() -> Self {
        Self::new(CloseCode::Normal, REASON_DONE)
    }

    /// 上游执行失败
    pub fn streams_exception() -> Self {
        Self::new(CloseCode::UnexpectedCondition, REASON_STREAMS_EXCEPTION)
    }

    /// schema 发送失败
    pub fn schema_failed() -> Self {
        Self::new(CloseCode::ProtocolError, REASON_SCHEMA_FAILED)
    }
}

#[cfg(feature = "ws")]
impl From<CloseReason> for tokio_tungstenite::tungstenite::protocol::CloseFrame {
    fn from(close: CloseReason) -> Self {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;

        Self {
            code: WsCloseCode::from(close.code.as_u16()),
            reason: close.reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_values() {
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::ProtocolError.as_u16(), 1002);
        assert_eq!(CloseCode::UnexpectedCondition.as_u16(), 1011);
        assert!(!CloseCode::Normal.is_error());
        assert!(CloseCode::ProtocolError.is_error());
        assert!(CloseCode::UnexpectedCondition.is_error());
    }

    #[test]
    fn test_terminal_reasons() {
        assert_eq!(CloseReason::done(), CloseReason::new(CloseCode::Normal, "done"));
        assert_eq!(CloseReason::streams_exception().reason, "streams exception");
        assert_eq!(CloseReason::schema_failed().code, CloseCode::ProtocolError);
    }

    #[cfg(feature = "ws")]
    #[test]
    fn test_close_frame_conversion() {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        let frame = CloseFrame::from(CloseReason::streams_exception());
        assert_eq!(frame.code, WsCloseCode::Error);
        assert_eq!(frame.reason.as_str(), "streams exception");

        let frame = CloseFrame::from(CloseReason::schema_failed());
        assert_eq!(frame.code, WsCloseCode::Protocol);
    }
}
