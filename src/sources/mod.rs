//! 按需投递的数据源

mod stream;

pub use stream::{DemandSubscription, StreamPublisher};
