//! Example: demand-driven stream to WebSocket session
//!
//! This example bridges a slow, batch-producing source to a WebSocket
//! session. The bridge requests one batch at a time, so the source is
//! only polled as fast as the session accepts messages.
//!
//! Run with: cargo run --example stream_to_ws --features "ws,json"

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use ws_stream_bridge::{JsonEncoder, Schema, SourceError, StreamBridge, StreamPublisher, WebSocketSessionSink};

#[derive(Debug, Serialize)]
struct Trade {
    symbol: &'static str,
    price: f64,
    volume: u64,
}

#[tokio::main]
async fn main() {
    println!("Stream to WebSocket Bridge Example\n");

    // Mock query source: three batches, then completion
    let source = async_stream::stream! {
        let batches = vec![
            vec![
                Trade { symbol: "ACME", price: 10.5, volume: 100 },
                Trade { symbol: "INIT", price: 3.25, volume: 40 },
            ],
            vec![Trade { symbol: "ACME", price: 10.75, volume: 20 }],
            vec![Trade { symbol: "INIT", price: 3.5, volume: 75 }],
        ];
        for batch in batches {
            // Simulate query latency
            tokio::time::sleep(Duration::from_millis(300)).await;
            yield Ok::<_, SourceError>(batch);
        }
    };

    let publisher = StreamPublisher::new(source).with_schema(
        Schema::new()
            .with_field("SYMBOL", "STRING")
            .with_field("PRICE", "DOUBLE")
            .with_field("VOLUME", "BIGINT"),
    );

    // Create a WebSocket session sink (channel-based for demo)
    let (session, mut ws_rx) = WebSocketSessionSink::new("demo-session", 16);

    // Spawn a task to consume WebSocket messages
    let ws_consumer = tokio::spawn(async move {
        println!("WebSocket consumer started, waiting for messages...\n");

        while let Some(msg) = ws_rx.recv().await {
            match msg {
                Message::Text(text) => println!("  WS received text: {}", text),
                Message::Close(frame) => {
                    println!("  WS connection closed: {:?}", frame);
                    break;
                }
                _ => {}
            }
        }
    });

    let bridge = Arc::new(StreamBridge::<Trade, _>::new(Arc::new(session), JsonEncoder::new()));

    let delivery = match bridge.start(&publisher) {
        Ok(handle) => handle,
        Err(e) => {
            println!("Failed to start bridge: {}", e);
            return;
        }
    };

    let _ = delivery.await;
    let _ = ws_consumer.await;

    let stats = bridge.stats();
    println!(
        "\nBridge finished: {} batches, {} messages, {} demand requests",
        stats.batches_received(),
        stats.items_submitted(),
        stats.demand_requests()
    );
}
