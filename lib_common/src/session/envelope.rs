//! JSON envelopes exchanged with the server, one per WebSocket text message.

use serde::{Deserialize, Serialize};

/// Unix time in seconds, as used by every outbound `timestamp` field.
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Messages sent by the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// A still capture, answering `capture_request`.
    Image {
        device_id: String,
        /// Base64 JPEG.
        image: String,
        timestamp: i64,
        requesting_client_id: Option<String>,
        battery: Option<u8>,
    },
    /// One stream frame for one viewer.
    Frame {
        device_id: String,
        /// Base64 JPEG.
        image: String,
        timestamp: i64,
        client_id: String,
        battery: Option<u8>,
    },
    StatusUpdate {
        device_id: String,
        battery: Option<u8>,
        uptime: u64,
        timestamp: i64,
    },
    Ping {
        device_id: String,
        timestamp: i64,
    },
}

impl Outbound {
    /// The wire `type` tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Image { .. } => "image",
            Outbound::Frame { .. } => "frame",
            Outbound::StatusUpdate { .. } => "status_update",
            Outbound::Ping { .. } => "ping",
        }
    }
}

/// Messages received from the server. Unknown types decode to [`Inbound::Unknown`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Connected {
        #[serde(default)]
        message: Option<String>,
    },
    CaptureRequest {
        #[serde(default)]
        client_id: Option<String>,
    },
    StreamRequest {
        #[serde(default)]
        client_id: Option<String>,
    },
    StopStream {
        #[serde(default)]
        client_id: Option<String>,
    },
    Pong {},
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl Inbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Connected { .. } => "connected",
            Inbound::CaptureRequest { .. } => "capture_request",
            Inbound::StreamRequest { .. } => "stream_request",
            Inbound::StopStream { .. } => "stop_stream",
            Inbound::Pong {} => "pong",
            Inbound::Error { .. } => "error",
            Inbound::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_serializes_with_type_tag_and_client_id() {
        let frame = Outbound::Frame {
            device_id: "pi-1".into(),
            image: "AAAA".into(),
            timestamp: 1_700_000_000,
            client_id: "viewer-a".into(),
            battery: None,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "frame",
                "device_id": "pi-1",
                "image": "AAAA",
                "timestamp": 1_700_000_000,
                "client_id": "viewer-a",
                "battery": null
            })
        );
    }

    #[test]
    fn image_carries_requesting_client() {
        let image = Outbound::Image {
            device_id: "pi-1".into(),
            image: "AAAA".into(),
            timestamp: 1,
            requesting_client_id: Some("web-7".into()),
            battery: Some(90),
        };
        let value = serde_json::to_value(&image).unwrap();
        assert_eq!(value["type"], "image");
        assert_eq!(value["requesting_client_id"], "web-7");
        assert_eq!(value["battery"], 90);
    }

    #[test]
    fn status_and_ping_tags() {
        let status = Outbound::StatusUpdate {
            device_id: "d".into(),
            battery: Some(50),
            uptime: 42,
            timestamp: 3,
        };
        assert_eq!(serde_json::to_value(&status).unwrap()["type"], "status_update");
        let ping = Outbound::Ping {
            device_id: "d".into(),
            timestamp: 3,
        };
        assert_eq!(serde_json::to_value(&ping).unwrap()["type"], "ping");
    }

    #[test]
    fn decodes_inbound_control_messages() {
        let parse = |s: &str| serde_json::from_str::<Inbound>(s).unwrap();

        assert_eq!(
            parse(r#"{"type":"stream_request","client_id":"a"}"#),
            Inbound::StreamRequest {
                client_id: Some("a".into())
            }
        );
        assert_eq!(parse(r#"{"type":"stop_stream","client_id":"a"}"#).kind(), "stop_stream");
        assert_eq!(
            parse(r#"{"type":"capture_request"}"#),
            Inbound::CaptureRequest { client_id: None }
        );
        assert_eq!(parse(r#"{"type":"pong"}"#), Inbound::Pong {});
        assert_eq!(
            parse(r#"{"type":"connected","message":"welcome","extra":1}"#),
            Inbound::Connected {
                message: Some("welcome".into())
            }
        );
        assert_eq!(parse(r#"{"type":"firmware_update","url":"x"}"#), Inbound::Unknown);
    }

    #[test]
    fn rejects_untagged_json() {
        assert!(serde_json::from_str::<Inbound>(r#"{"client_id":"a"}"#).is_err());
        assert!(serde_json::from_str::<Inbound>("not json").is_err());
    }
}
