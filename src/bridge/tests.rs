use super::*;
use crate::error::{EncodeError, SinkError};
use std::sync::atomic::AtomicI64;
use std::sync::{Mutex, Weak};
use std::time::Duration;

/// 记录所有调用的会话
#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Bytes>>,
    preambles: Mutex<Vec<Bytes>>,
    closes: Mutex<Vec<CloseReason>>,
    fail_sends: bool,
    fail_preamble: bool,
    on_send: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
}

impl RecordingSink {
    fn failing_sends() -> Self {
        Self {
            fail_sends: true,
            ..Default::default()
        }
    }

    fn failing_preamble() -> Self {
        Self {
            fail_preamble: true,
            ..Default::default()
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().unwrap().clone()
    }
}

impl SessionSink for RecordingSink {
    fn id(&self) -> &str {
        "session-42"
    }

    fn send_async(&self, payload: Bytes) -> SendFuture {
        let count = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(payload);
            sent.len()
        };
        if let Some(hook) = self.on_send.lock().unwrap().as_ref() {
            hook(count);
        }

        let result = if self.fail_sends {
            Err(SinkError::Send("connection reset".to_string()))
        } else {
            Ok(())
        };
        Box::pin(std::future::ready(result))
    }

    fn send(&self, payload: Bytes) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_preamble {
                return Err(SinkError::Send("transport rejected".to_string()));
            }
            self.preambles.lock().unwrap().push(payload);
            Ok(())
        })
    }

    fn close(&self, reason: CloseReason) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            self.closes.lock().unwrap().push(reason);
            Ok(())
        })
    }
}

/// 记录需求和取消的订阅句柄
#[derive(Default)]
struct MockSubscription {
    requests: AtomicU64,
    cancels: AtomicU64,
    outstanding: AtomicI64,
    max_outstanding: AtomicI64,
}

impl MockSubscription {
    fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn cancels(&self) -> u64 {
        self.cancels.load(Ordering::SeqCst)
    }

    /// 模拟上游消耗一个需求单位
    fn fulfil(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Subscription for MockSubscription {
    fn request(&self, n: u64) {
        self.requests.fetch_add(n, Ordering::SeqCst);
        let outstanding = self.outstanding.fetch_add(n as i64, Ordering::SeqCst) + n as i64;
        self.max_outstanding.fetch_max(outstanding, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// 把 "x" 视为无法编码的数据
struct TestEncoder;

impl Encoder<String> for TestEncoder {
    fn encode(&self, item: &String) -> Result<Bytes, EncodeError> {
        if item == "x" {
            return Err(EncodeError::Unsupported(item.clone()));
        }
        Ok(Bytes::from(item.clone()))
    }
}

impl Encoder<Schema> for TestEncoder {
    fn encode(&self, schema: &Schema) -> Result<Bytes, EncodeError> {
        Ok(Bytes::from(schema.to_string()))
    }
}

type TestBridge = StreamBridge<String, TestEncoder>;

fn bridge_with(sink: RecordingSink) -> (Arc<TestBridge>, Arc<RecordingSink>) {
    let sink = Arc::new(sink);
    let bridge = Arc::new(StreamBridge::new(sink.clone(), TestEncoder));
    (bridge, sink)
}

fn started(sink: RecordingSink) -> (Arc<TestBridge>, Arc<RecordingSink>, Arc<MockSubscription>) {
    let (bridge, sink) = bridge_with(sink);
    let subscription = Arc::new(MockSubscription::default());
    bridge.attach_subscription(subscription.clone());
    (bridge, sink, subscription)
}

fn rows(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_start_requests_one_batch() {
    let (bridge, _sink, subscription) = started(RecordingSink::default());

    assert_eq!(subscription.requests(), 1);
    assert_eq!(bridge.stats().demand_requests(), 1);
    assert!(!bridge.is_closed());
    assert_eq!(bridge.session_id(), "session-42");
}

#[tokio::test]
async fn test_batch_sent_in_order_then_demand() {
    let (bridge, sink, subscription) = started(RecordingSink::default());

    bridge.on_batch(rows(&["a", "b"]));

    assert_eq!(sink.sent(), vec!["a", "b"]);
    assert_eq!(subscription.requests(), 2);
    assert_eq!(bridge.stats().items_submitted(), 2);
}

#[tokio::test]
async fn test_encode_failure_skips_item_only() {
    let (bridge, sink, subscription) = started(RecordingSink::default());

    bridge.on_batch(rows(&["x"]));

    assert!(sink.sent().is_empty());
    assert_eq!(bridge.stats().encode_failures(), 1);
    assert_eq!(subscription.requests(), 2);
    assert!(!bridge.is_closed());
    assert!(sink.closes().is_empty());

    bridge.on_batch(rows(&["a", "x", "b"]));
    assert_eq!(sink.sent(), vec!["a", "b"]);
    assert_eq!(subscription.requests(), 3);
}

#[tokio::test]
async fn test_empty_batch_still_requests() {
    let (bridge, sink, subscription) = started(RecordingSink::default());

    bridge.on_batch(Vec::new());

    assert!(sink.sent().is_empty());
    assert_eq!(subscription.requests(), 2);
}

#[tokio::test]
async fn test_never_more_than_one_outstanding() {
    let (bridge, _sink, subscription) = started(RecordingSink::default());

    for i in 0..10 {
        subscription.fulfil();
        bridge.on_batch(vec![i.to_string()]);
    }

    assert_eq!(subscription.requests(), 11);
    assert_eq!(subscription.max_outstanding.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_complete_closes_normally() {
    let (bridge, sink, subscription) = started(RecordingSink::default());

    bridge.on_upstream_complete().await;

    assert!(bridge.is_closed());
    assert_eq!(sink.closes(), vec![CloseReason::new(CloseCode::Normal, "done")]);

    // 关闭后迟到的批次不发送也不请求
    bridge.on_batch(rows(&["late"]));
    assert!(sink.sent().is_empty());
    assert_eq!(subscription.requests(), 1);

    bridge.on_upstream_complete().await;
    bridge.on_upstream_error(SourceError::Upstream("late".to_string())).await;
    assert_eq!(sink.closes().len(), 1);
}

#[tokio::test]
async fn test_error_closes_with_unexpected_condition() {
    let (bridge, sink, _subscription) = started(RecordingSink::default());

    bridge
        .on_upstream_error(SourceError::Upstream("query failed".to_string()))
        .await;

    assert!(bridge.is_closed());
    assert_eq!(
        sink.closes(),
        vec![CloseReason::new(CloseCode::UnexpectedCondition, "streams exception")]
    );

    bridge.on_upstream_complete().await;
    assert_eq!(sink.closes().len(), 1);
}

#[tokio::test]
async fn test_preamble_failure_before_start() {
    let (bridge, sink) = bridge_with(RecordingSink::failing_preamble());

    bridge.send_preamble(&Schema::new().with_field("ID", "INT")).await;

    assert!(bridge.is_closed());
    assert_eq!(
        sink.closes(),
        vec![CloseReason::new(CloseCode::ProtocolError, "Unable to send schema")]
    );

    // 之后建立的订阅被立即取消，不发出需求
    let subscription = Arc::new(MockSubscription::default());
    bridge.attach_subscription(subscription.clone());
    assert_eq!(subscription.requests(), 0);
    assert_eq!(subscription.cancels(), 1);
}

#[tokio::test]
async fn test_preamble_failure_after_start_cancels() {
    let (bridge, sink, subscription) = started(RecordingSink::failing_preamble());

    bridge.send_preamble(&Schema::new()).await;

    assert!(bridge.is_closed());
    assert_eq!(subscription.cancels(), 1);
    assert_eq!(sink.closes().len(), 1);
}

#[tokio::test]
async fn test_preamble_sent_once() {
    let (bridge, sink, _subscription) = started(RecordingSink::default());
    let schema = Schema::new().with_field("ID", "INT");

    bridge.send_preamble(&schema).await;
    bridge.send_preamble(&schema).await;

    let preambles = sink.preambles.lock().unwrap().clone();
    assert_eq!(preambles, vec![Bytes::from("ID INT")]);
    assert!(!bridge.is_closed());
}

#[tokio::test]
async fn test_close_cancels_without_closing_session() {
    let (bridge, sink, subscription) = started(RecordingSink::default());

    bridge.close();
    bridge.cancel();

    assert!(bridge.is_closed());
    assert_eq!(subscription.cancels(), 1);
    assert!(sink.closes().is_empty());

    bridge.on_batch(rows(&["a"]));
    assert!(sink.sent().is_empty());
    assert_eq!(subscription.requests(), 1);

    // 外部关闭之后的终止信号不再关闭会话
    bridge.on_upstream_complete().await;
    assert!(sink.closes().is_empty());
}

#[tokio::test]
async fn test_close_before_start() {
    let (bridge, _sink) = bridge_with(RecordingSink::default());
    bridge.close();

    let subscription = Arc::new(MockSubscription::default());
    bridge.attach_subscription(subscription.clone());

    assert_eq!(subscription.requests(), 0);
    assert_eq!(subscription.cancels(), 1);
}

#[tokio::test]
async fn test_cancel_mid_batch() {
    let (bridge, sink, subscription) = started(RecordingSink::failing_sends());

    let weak: Weak<TestBridge> = Arc::downgrade(&bridge);
    *sink.on_send.lock().unwrap() = Some(Box::new(move |count: usize| {
        if count == 1 {
            if let Some(bridge) = weak.upgrade() {
                bridge.cancel();
            }
        }
    }));

    bridge.on_batch(rows(&["a", "b", "c"]));

    assert!(bridge.is_closed());
    assert_eq!(sink.sent(), vec!["a"]);
    assert_eq!(subscription.cancels(), 1);
    assert_eq!(subscription.requests(), 1);

    // 已提交的发送仍然完成，失败只记录日志
    eventually(|| bridge.stats().send_failures() == 1).await;
    assert!(sink.closes().is_empty());
}

#[tokio::test]
async fn test_send_failure_does_not_change_state() {
    let (bridge, sink, subscription) = started(RecordingSink::failing_sends());

    bridge.on_batch(rows(&["a", "b"]));

    eventually(|| bridge.stats().send_failures() == 2).await;
    assert!(!bridge.is_closed());
    assert_eq!(subscription.requests(), 2);
    assert!(sink.closes().is_empty());
}

#[tokio::test]
async fn test_extra_subscription_cancelled() {
    let (bridge, _sink, first) = started(RecordingSink::default());

    let second = Arc::new(MockSubscription::default());
    bridge.attach_subscription(second.clone());

    assert_eq!(second.cancels(), 1);
    assert_eq!(second.requests(), 0);
    assert_eq!(first.cancels(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_close_during_batches() {
    let (bridge, sink, subscription) = started(RecordingSink::default());

    let closer = {
        let bridge = bridge.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1));
            bridge.close();
        })
    };

    let handle = tokio::runtime::Handle::current();
    let worker = {
        let bridge = bridge.clone();
        std::thread::spawn(move || {
            let _guard = handle.enter();
            for _ in 0..200 {
                bridge.on_batch(rows(&["a"; 50]));
            }
        })
    };

    closer.join().unwrap();
    worker.join().unwrap();

    assert!(bridge.is_closed());
    assert_eq!(subscription.cancels(), 1);
    assert!(sink.closes().is_empty());
    assert!(subscription.requests() <= bridge.stats().batches_received() + 1);

    let sent = sink.sent().len() as u64;
    let requests = subscription.requests();
    bridge.on_batch(rows(&["after"]));
    assert_eq!(sink.sent().len() as u64, sent);
    assert_eq!(subscription.requests(), requests);
}

#[tokio::test]
async fn test_builder() {
    let bridge: Option<TestBridge> = StreamBridgeBuilder::new()
        .sink(RecordingSink::default())
        .encoder(TestEncoder)
        .session_id("custom")
        .build();
    assert_eq!(bridge.unwrap().session_id(), "custom");

    let missing: Option<TestBridge> = StreamBridgeBuilder::<TestEncoder>::new()
        .sink(RecordingSink::default())
        .build();
    assert!(missing.is_none());
}

#[test]
fn test_batch_outside_runtime_does_not_panic() {
    let (bridge, sink, subscription) = started(RecordingSink::default());

    bridge.on_batch(rows(&["a", "b"]));

    // 没有可用的运行时，数据记为发送失败，需求协议照常推进
    assert!(sink.sent().is_empty());
    assert_eq!(bridge.stats().send_failures(), 2);
    assert_eq!(bridge.stats().items_submitted(), 0);
    assert_eq!(subscription.requests(), 2);
    assert!(!bridge.is_closed());
}

#[test]
fn test_batch_from_plain_thread_uses_configured_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();

    let sink = Arc::new(RecordingSink::failing_sends());
    let bridge: Arc<TestBridge> = Arc::new(
        StreamBridgeBuilder::new()
            .shared_sink(sink.clone())
            .encoder(TestEncoder)
            .runtime(runtime.handle().clone())
            .build()
            .unwrap(),
    );
    let subscription = Arc::new(MockSubscription::default());
    bridge.attach_subscription(subscription.clone());

    let worker = {
        let bridge = bridge.clone();
        std::thread::spawn(move || bridge.on_batch(rows(&["a"])))
    };
    worker.join().unwrap();

    assert_eq!(sink.sent(), vec!["a"]);
    assert_eq!(bridge.stats().items_submitted(), 1);
    assert_eq!(subscription.requests(), 2);

    // 发送结果由配置的运行时等待
    for _ in 0..200 {
        if bridge.stats().send_failures() == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(bridge.stats().send_failures(), 1);
}
