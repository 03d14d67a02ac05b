use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::event::ExperimentId;

/// Sentinel serialized for the message-count status, matching the wire shape
/// `{"status":"msg_count_increment"}`.
pub const MSG_COUNT_INCREMENT: &str = "msg_count_increment";

/// One consolidated table row: the experiment key plus its sparse columns.
#[derive(Debug, Clone, Serialize)]
pub struct Row {
    pub experiment_id: ExperimentId,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// One new or revised chart point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPointUpdate {
    pub chart_id: String,
    pub exp_id: ExperimentId,
    pub epoch: u64,
    pub score: f64,
}

/// Consolidated per-flush delta handed to the consumer.
///
/// `table_headers` is present only when the header set grew this flush.
/// `table_data` carries the full current row for every experiment touched
/// this flush; applying a row twice is safe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_headers: Option<Vec<String>>,
    pub table_data: Vec<Row>,
    pub charts_updates: Vec<ChartPointUpdate>,
}

impl PublishUpdate {
    pub fn is_empty(&self) -> bool {
        self.table_headers.is_none() && self.table_data.is_empty() && self.charts_updates.is_empty()
    }
}

/// Connection state snapshot, published unbuffered on connect and disconnect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_socket_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_search_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rest_api_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum StatusBody {
    Connection(ConnectionStatus),
    Ping { ping: u64 },
    Throughput { throughput: f64 },
    Sentinel(&'static str),
}

/// Unbuffered status message. Serializes to `{"status": ...}` with the body
/// shape depending on the variant.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    status: StatusBody,
}

impl StatusUpdate {
    pub fn connection(status: ConnectionStatus) -> Self {
        Self {
            status: StatusBody::Connection(status),
        }
    }

    pub fn ping(ping_ms: u64) -> Self {
        Self {
            status: StatusBody::Ping { ping: ping_ms },
        }
    }

    pub fn throughput(msgs_per_sec: f64) -> Self {
        Self {
            status: StatusBody::Throughput {
                throughput: msgs_per_sec,
            },
        }
    }

    pub fn msg_count_increment() -> Self {
        Self {
            status: StatusBody::Sentinel(MSG_COUNT_INCREMENT),
        }
    }

    /// True for the `msg_count_increment` sentinel.
    pub fn is_msg_count_increment(&self) -> bool {
        matches!(self.status, StatusBody::Sentinel(MSG_COUNT_INCREMENT))
    }

    /// Connection snapshot carried by this status, if any.
    pub fn as_connection(&self) -> Option<&ConnectionStatus> {
        match &self.status {
            StatusBody::Connection(c) => Some(c),
            _ => None,
        }
    }

    /// Ping round-trip in milliseconds carried by this status, if any.
    pub fn as_ping(&self) -> Option<u64> {
        match self.status {
            StatusBody::Ping { ping } => Some(ping),
            _ => None,
        }
    }

    /// Throughput in messages per second carried by this status, if any.
    pub fn as_throughput(&self) -> Option<f64> {
        match self.status {
            StatusBody::Throughput { throughput } => Some(throughput),
            _ => None,
        }
    }
}

/// Message sent across the consumer boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    /// Buffered, consolidated aggregation delta.
    Data(PublishUpdate),
    /// Unbuffered liveness/throughput/connection signal.
    Status(StatusUpdate),
}

/// Settings used to (re)initialize the connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    pub grid_search_id: String,
    #[serde(rename = "socketConnectionUrl")]
    pub socket_url: String,
    #[serde(default)]
    pub rest_api_url: Option<String>,
}

/// Control message from the consumer to the pipeline.
#[derive(Debug, Clone)]
pub enum Control {
    /// (Re)connect with new parameters; resets aggregation state.
    Connect(ConnectionSettings),
    /// Tear down the connection.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_shapes() {
        let ping = serde_json::to_string(&StatusUpdate::ping(42)).expect("ping");
        assert_eq!(ping, r#"{"status":{"ping":42}}"#);

        let tp = serde_json::to_string(&StatusUpdate::throughput(12.5)).expect("throughput");
        assert_eq!(tp, r#"{"status":{"throughput":12.5}}"#);

        let inc = serde_json::to_string(&StatusUpdate::msg_count_increment()).expect("increment");
        assert_eq!(inc, r#"{"status":"msg_count_increment"}"#);

        let conn = serde_json::to_string(&StatusUpdate::connection(ConnectionStatus {
            is_socket_connected: false,
            grid_search_id: None,
            rest_api_url: None,
        }))
        .expect("connection");
        assert_eq!(conn, r#"{"status":{"isSocketConnected":false}}"#);
    }

    #[test]
    fn test_publish_update_omits_headers_when_unchanged() {
        let update = PublishUpdate {
            table_headers: None,
            table_data: Vec::new(),
            charts_updates: vec![ChartPointUpdate {
                chart_id: "train_F1".to_string(),
                exp_id: ExperimentId::new("1"),
                epoch: 0,
                score: 0.2,
            }],
        };

        let json = serde_json::to_string(&update).expect("serialize");
        assert!(!json.contains("tableHeaders"));
        assert!(json.contains(r#""chartsUpdates":[{"chart_id":"train_F1","exp_id":1,"epoch":0,"score":0.2}]"#));
    }

    #[test]
    fn test_connection_settings_wire_keys() {
        let settings: ConnectionSettings = serde_json::from_str(
            r#"{
                "gridSearchId": "gs-1",
                "socketConnectionUrl": "ws://localhost:8080/socket",
                "restApiUrl": "http://localhost:8080/api"
            }"#,
        )
        .expect("deserialize");
        assert_eq!(settings.grid_search_id, "gs-1");
        assert_eq!(settings.socket_url, "ws://localhost:8080/socket");
        assert_eq!(
            settings.rest_api_url.as_deref(),
            Some("http://localhost:8080/api")
        );
    }

    #[test]
    fn test_row_flattens_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("train_F1".to_string(), serde_json::json!(0.5));
        let row = Row {
            experiment_id: ExperimentId::new("7"),
            fields,
        };
        let json = serde_json::to_string(&row).expect("serialize");
        assert_eq!(json, r#"{"experiment_id":7,"train_F1":0.5}"#);
    }
}
