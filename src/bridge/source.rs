//! 按需拉取的上游数据源 trait
//!
//! 上游只有在订阅者通过 [`Subscription::request`] 声明需求后才会投递批次。
//! 同一个订阅者的 `on_next`/`on_error`/`on_complete` 由上游串行调用。

use crate::error::SourceError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// 订阅者持有的需求信号句柄
pub trait Subscription: Send + Sync {
    /// 声明还可以接收 `n` 个批次
    fn request(&self, n: u64);

    /// 永久停止投递，可重复调用
    fn cancel(&self);
}

/// 按批次接收数据的订阅者
pub trait Subscriber<T>: Send + Sync {
    /// 订阅建立时调用，只调用一次
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    /// 投递一个批次，必须不阻塞
    fn on_next(&self, batch: Vec<T>);

    /// 上游不可恢复的错误，之后不再有任何投递
    fn on_error(&self, error: SourceError) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// 上游正常结束，之后不再有任何投递
    fn on_complete(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// 在第一个批次之前投递描述数据结构的 schema
    fn on_schema<'a>(&'a self, schema: &'a Schema) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        let _ = schema;
        Box::pin(async {})
    }
}

/// 可以被订阅的数据源
pub trait Publisher<T>: Send + Sync {
    /// 注册订阅者并开始投递
    ///
    /// 返回驱动投递的任务句柄。
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Result<JoinHandle<()>, SourceError>;
}

/// schema 中的一个字段
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct SchemaField {
    pub name: String,
    #[cfg_attr(feature = "json", serde(rename = "type"))]
    pub field_type: String,
}

/// 描述后续数据结构的前导消息
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct Schema {
    pub fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个字段
    pub fn with_field(mut self, name: impl Into<String>, field_type: impl Into<String>) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            field_type: field_type.into(),
        });
        self
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", field.name, field.field_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_display() {
        let schema = Schema::new()
            .with_field("ID", "BIGINT")
            .with_field("NAME", "STRING");

        assert_eq!(schema.to_string(), "ID BIGINT, NAME STRING");
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_schema_json() {
        let schema = Schema::new().with_field("ID", "BIGINT");
        let json = serde_json::to_string(&schema).unwrap();

        assert_eq!(json, r#"{"fields":[{"name":"ID","type":"BIGINT"}]}"#);
    }
}
