//! 数据编码器：把上游数据转换为发往会话的字节

use crate::error::EncodeError;
use bytes::Bytes;
use std::marker::PhantomData;

/// 把单条数据编码为字节的 trait
///
/// 编码是同步的，失败只影响当前这一条数据。
pub trait Encoder<T: ?Sized>: Send + Sync {
    /// 编码一条数据
    fn encode(&self, item: &T) -> Result<Bytes, EncodeError>;
}

impl<T: ?Sized, E: Encoder<T> + ?Sized> Encoder<T> for std::sync::Arc<E> {
    fn encode(&self, item: &T) -> Result<Bytes, EncodeError> {
        (**self).encode(item)
    }
}

/// 使用 serde_json 把数据编码为 JSON 文本
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder {
    pretty: bool,
}

#[cfg(feature = "json")]
impl JsonEncoder {
    /// 创建紧凑格式的 JSON 编码器
    pub fn new() -> Self {
        Self::default()
    }

    /// 输出带缩进的 JSON
    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }
}

#[cfg(feature = "json")]
impl<T: serde::Serialize + ?Sized> Encoder<T> for JsonEncoder {
    fn encode(&self, item: &T) -> Result<Bytes, EncodeError> {
        let buffer = if self.pretty {
            serde_json::to_vec_pretty(item)?
        } else {
            serde_json::to_vec(item)?
        };
        Ok(Bytes::from(buffer))
    }
}

/// 由闭包实现的编码器
pub struct FnEncoder<T: ?Sized, F> {
    f: F,
    _item: PhantomData<fn(&T)>,
}

impl<T: ?Sized, F> FnEncoder<T, F>
where
    F: Fn(&T) -> Result<Bytes, EncodeError> + Send + Sync,
{
    /// 使用给定的编码函数创建编码器
    pub fn new(f: F) -> Self {
        Self {
            f,
            _item: PhantomData,
        }
    }
}

impl<T: ?Sized, F> Encoder<T> for FnEncoder<T, F>
where
    F: Fn(&T) -> Result<Bytes, EncodeError> + Send + Sync,
{
    fn encode(&self, item: &T) -> Result<Bytes, EncodeError> {
        (self.f)(item)
    }
}

/// 把实现了 `Display` 的数据编码为 UTF-8 文本
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayEncoder;

impl<T: std::fmt::Display + ?Sized> Encoder<T> for DisplayEncoder {
    fn encode(&self, item: &T) -> Result<Bytes, EncodeError> {
        Ok(Bytes::from(item.to_string()))
    }
}
