//! End-to-end pipeline tests: wire-shaped frames in, consolidated updates
//! and status messages out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gridscope::config::PipelineConfig;
use gridscope::event::decode_frame;
use gridscope::export::health::HealthMetrics;
use gridscope::output::{ConnectionSettings, Outbound};
use gridscope::pipeline::stats::ThroughputStats;
use gridscope::pipeline::store::AggregationStore;
use gridscope::pipeline::{classify, InboundFrame, Pipeline};

/// Feeds wire-shaped frames through decode, classification, and the store,
/// then checks the published JSON shape.
#[test]
fn test_frames_to_publish_shape() {
    let mut store = AggregationStore::new();

    let frames = [
        json!({
            "event_type": "job_status",
            "creation_ts": 1.0,
            "payload": {"experiment_id": 7, "status": "RUNNING", "device": "cuda:0"}
        })
        .to_string(),
        json!({
            "event_id": "batched_events",
            "data": [
                {
                    "event_type": "experiment_status",
                    "creation_ts": 2.0,
                    "payload": {
                        "experiment_id": 7,
                        "status": "evaluation",
                        "num_epochs": 10,
                        "current_epoch": 2
                    }
                },
                {
                    "event_type": "evaluation_result",
                    "creation_ts": 3.0,
                    "payload": {
                        "experiment_id": 7,
                        "epoch": 1,
                        "metric_scores": [{"metric": "F1", "split": "train", "score": 0.5}],
                        "loss_scores": []
                    }
                }
            ]
        })
        .to_string(),
    ];

    for frame in &frames {
        for raw in decode_frame(frame).expect("decode") {
            let event = raw.normalize().expect("normalize");
            classify::apply(&mut store, &event);
        }
    }

    let update = store.take_update().expect("update");
    let wire: Value = serde_json::to_value(&update).expect("serialize");

    let headers = wire["tableHeaders"].as_array().expect("headers");
    assert!(headers.contains(&json!("experiment_id")));
    assert!(headers.contains(&json!("job_status")));
    assert!(headers.contains(&json!("model_status")));
    assert!(headers.contains(&json!("train_F1")));

    let rows = wire["tableData"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["experiment_id"], json!(7));
    assert_eq!(rows[0]["job_status"], json!("RUNNING"));
    assert_eq!(rows[0]["model_status"], json!("evaluation"));
    assert_eq!(rows[0]["epoch_progress"], json!(0.2));
    assert_eq!(rows[0]["train_F1"], json!(0.5));

    let charts = wire["chartsUpdates"].as_array().expect("charts");
    assert_eq!(charts.len(), 1);
    assert_eq!(charts[0]["chart_id"], json!("train_F1"));
    assert_eq!(charts[0]["epoch"], json!(1));
    assert_eq!(charts[0]["score"], json!(0.5));

    // Nothing changed since: no second update.
    assert!(store.take_update().is_none());
}

fn test_pipeline(max_messages: usize) -> (Pipeline, mpsc::Receiver<Outbound>) {
    let cfg = PipelineConfig {
        max_messages,
        window: Duration::from_millis(50),
        // Long enough to stay silent during these tests.
        status_interval: Duration::from_secs(60),
        channel_capacity: 64,
    };
    let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
    let stats = Arc::new(ThroughputStats::new());
    let (out_tx, out_rx) = mpsc::channel(64);

    (Pipeline::new(cfg, health, stats, out_tx), out_rx)
}

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        grid_search_id: "gs-1".to_string(),
        socket_url: "ws://localhost:8080/socket".to_string(),
        rest_api_url: None,
    }
}

fn payload_frame(experiment_id: u64, status: &str) -> InboundFrame {
    InboundFrame::Payload(
        json!({
            "event_type": "job_status",
            "creation_ts": 0.0,
            "payload": {"experiment_id": experiment_id, "status": status}
        })
        .to_string(),
    )
}

async fn recv(out_rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
        .await
        .expect("output within deadline")
        .expect("channel open")
}

#[tokio::test]
async fn test_count_bound_flush_and_session_lifecycle() {
    let (mut pipeline, mut out_rx) = test_pipeline(2);
    let frame_tx = pipeline.frame_sender();
    let cancel = CancellationToken::new();
    pipeline.start(cancel.clone()).expect("start");

    frame_tx
        .send(InboundFrame::Connected {
            settings: settings(),
        })
        .await
        .expect("send");

    // Connection status comes first.
    let first = recv(&mut out_rx).await;
    match first {
        Outbound::Status(status) => {
            let conn = status.as_connection().expect("connection status");
            assert!(conn.is_socket_connected);
            assert_eq!(conn.grid_search_id.as_deref(), Some("gs-1"));
        }
        other => panic!("expected connection status, got {other:?}"),
    }

    // Two events hit the count bound and force a flush before the window.
    frame_tx.send(payload_frame(1, "RUNNING")).await.expect("send");
    frame_tx.send(payload_frame(2, "RUNNING")).await.expect("send");

    let mut increments = 0;
    let update = loop {
        match recv(&mut out_rx).await {
            Outbound::Status(status) if status.is_msg_count_increment() => increments += 1,
            Outbound::Data(update) => break update,
            other => panic!("unexpected output {other:?}"),
        }
    };
    assert_eq!(increments, 2);
    assert_eq!(update.table_data.len(), 2);
    assert!(update.table_headers.is_some());

    // Close: remaining state is flushed, then the disconnect status set is
    // emitted exactly once.
    frame_tx.send(payload_frame(3, "DONE")).await.expect("send");
    frame_tx
        .send(InboundFrame::Closed {
            reason: "test close".to_string(),
        })
        .await
        .expect("send");

    let mut saw_final_row = false;
    let mut disconnects = 0;
    let mut zero_pings = 0;
    let mut zero_throughputs = 0;

    loop {
        let outbound = match tokio::time::timeout(Duration::from_millis(500), out_rx.recv()).await
        {
            Ok(Some(outbound)) => outbound,
            _ => break,
        };
        match outbound {
            Outbound::Status(status) if status.is_msg_count_increment() => {}
            Outbound::Status(status) => {
                if let Some(conn) = status.as_connection() {
                    assert!(!conn.is_socket_connected);
                    disconnects += 1;
                }
                if status.as_ping() == Some(0) {
                    zero_pings += 1;
                }
                if status.as_throughput() == Some(0.0) {
                    zero_throughputs += 1;
                }
            }
            Outbound::Data(update) => {
                assert_eq!(update.table_data.len(), 1);
                saw_final_row = true;
            }
        }
    }

    assert!(saw_final_row, "pending event flushed on close");
    assert_eq!(disconnects, 1);
    assert_eq!(zero_pings, 1);
    assert_eq!(zero_throughputs, 1);

    // A second close for the same (now inactive) session emits nothing.
    frame_tx
        .send(InboundFrame::Closed {
            reason: "duplicate".to_string(),
        })
        .await
        .expect("send");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), out_rx.recv())
            .await
            .is_err(),
        "duplicate close must be silent"
    );

    cancel.cancel();
    pipeline.wait_for_shutdown().await;
}

#[tokio::test]
async fn test_time_bound_flush_below_count_bound() {
    let (mut pipeline, mut out_rx) = test_pipeline(1000);
    let frame_tx = pipeline.frame_sender();
    let cancel = CancellationToken::new();
    pipeline.start(cancel.clone()).expect("start");

    frame_tx
        .send(InboundFrame::Connected {
            settings: settings(),
        })
        .await
        .expect("send");
    let _connected = recv(&mut out_rx).await;

    // One event, far below the count bound: the 50ms window publishes it.
    frame_tx.send(payload_frame(9, "RUNNING")).await.expect("send");

    let update = loop {
        match recv(&mut out_rx).await {
            Outbound::Status(status) if status.is_msg_count_increment() => {}
            Outbound::Data(update) => break update,
            other => panic!("unexpected output {other:?}"),
        }
    };
    assert_eq!(update.table_data.len(), 1);

    cancel.cancel();
    pipeline.wait_for_shutdown().await;
}

#[tokio::test]
async fn test_pong_publishes_ping_immediately() {
    let (mut pipeline, mut out_rx) = test_pipeline(1000);
    let frame_tx = pipeline.frame_sender();
    let cancel = CancellationToken::new();
    pipeline.start(cancel.clone()).expect("start");

    frame_tx
        .send(InboundFrame::Connected {
            settings: settings(),
        })
        .await
        .expect("send");
    let _connected = recv(&mut out_rx).await;

    frame_tx
        .send(InboundFrame::Pong { rtt_ms: 42 })
        .await
        .expect("send");

    match recv(&mut out_rx).await {
        Outbound::Status(status) => assert_eq!(status.as_ping(), Some(42)),
        other => panic!("expected ping status, got {other:?}"),
    }

    cancel.cancel();
    pipeline.wait_for_shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_dropped_alone() {
    let (mut pipeline, mut out_rx) = test_pipeline(1000);
    let frame_tx = pipeline.frame_sender();
    let cancel = CancellationToken::new();
    pipeline.start(cancel.clone()).expect("start");

    frame_tx
        .send(InboundFrame::Connected {
            settings: settings(),
        })
        .await
        .expect("send");
    let _connected = recv(&mut out_rx).await;

    frame_tx
        .send(InboundFrame::Payload("not json at all".to_string()))
        .await
        .expect("send");
    frame_tx.send(payload_frame(5, "RUNNING")).await.expect("send");

    // The good event still flows through.
    let update = loop {
        match recv(&mut out_rx).await {
            Outbound::Status(status) if status.is_msg_count_increment() => {}
            Outbound::Data(update) => break update,
            other => panic!("unexpected output {other:?}"),
        }
    };
    assert_eq!(update.table_data.len(), 1);
    assert_eq!(update.table_data[0].experiment_id.as_str(), "5");

    cancel.cancel();
    pipeline.wait_for_shutdown().await;
}

#[tokio::test]
async fn test_reconnect_resets_aggregation_state() {
    let (mut pipeline, mut out_rx) = test_pipeline(1000);
    let frame_tx = pipeline.frame_sender();
    let cancel = CancellationToken::new();
    pipeline.start(cancel.clone()).expect("start");

    frame_tx
        .send(InboundFrame::Connected {
            settings: settings(),
        })
        .await
        .expect("send");
    let _connected = recv(&mut out_rx).await;

    frame_tx.send(payload_frame(1, "RUNNING")).await.expect("send");
    let first = loop {
        match recv(&mut out_rx).await {
            Outbound::Status(status) if status.is_msg_count_increment() => {}
            Outbound::Data(update) => break update,
            other => panic!("unexpected output {other:?}"),
        }
    };
    assert!(first.table_headers.is_some());

    // Reconnect with new parameters drops the cumulative state, so the
    // next flush grows headers from scratch again.
    frame_tx
        .send(InboundFrame::Connected {
            settings: ConnectionSettings {
                grid_search_id: "gs-2".to_string(),
                ..settings()
            },
        })
        .await
        .expect("send");
    match recv(&mut out_rx).await {
        Outbound::Status(status) => {
            let conn = status.as_connection().expect("connection status");
            assert_eq!(conn.grid_search_id.as_deref(), Some("gs-2"));
        }
        other => panic!("expected connection status, got {other:?}"),
    }

    frame_tx.send(payload_frame(1, "RUNNING")).await.expect("send");
    let second = loop {
        match recv(&mut out_rx).await {
            Outbound::Status(status) if status.is_msg_count_increment() => {}
            Outbound::Data(update) => break update,
            other => panic!("unexpected output {other:?}"),
        }
    };
    assert!(
        second.table_headers.is_some(),
        "headers regrow after a reset"
    );

    cancel.cancel();
    pipeline.wait_for_shutdown().await;
}
