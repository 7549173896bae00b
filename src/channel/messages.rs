//! Event channel message types
//!
//! Inbound events form a closed set; anything outside it is a `ChannelParseError`.

use crate::error::ChannelParseError;
use crate::session::{AgentActivity, Asset, Speaker};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Interim or final transcript fragment
    Transcript {
        speaker: Speaker,
        text: String,
        is_final: bool,
    },
    /// Explicit agent activity
    AgentState { state: AgentActivity },
    /// Display an asset, optionally with an inline payload and a clip override
    ShowAsset {
        asset_id: String,
        /// A malformed payload is ignored and the id is resolved instead
        #[serde(default, deserialize_with = "lenient_asset")]
        asset: Option<Asset>,
        #[serde(default)]
        start_time: Option<f64>,
        #[serde(default)]
        end_time: Option<f64>,
    },
    /// Clear the displayed asset
    HideAsset,
    /// Reply to a client keep-alive ping
    Pong,
}

impl ServerEvent {
    /// Short name for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Transcript { .. } => "transcript",
            ServerEvent::AgentState { .. } => "agent_state",
            ServerEvent::ShowAsset { .. } => "show_asset",
            ServerEvent::HideAsset => "hide_asset",
            ServerEvent::Pong => "pong",
        }
    }
}

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level keep-alive
    Ping,
}

fn lenient_asset<'de, D>(deserializer: D) -> Result<Option<Asset>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(value) = Option::<serde_json::Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(asset) => Ok(Some(asset)),
        Err(e) => {
            warn!("Ignoring malformed inline asset: {}", e);
            Ok(None)
        }
    }
}

/// Parse one text frame into an event
pub fn parse_server_event(text: &str) -> Result<ServerEvent, ChannelParseError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AssetKind;

    #[test]
    fn test_transcript_deserialization() {
        let event =
            parse_server_event(r#"{"type":"transcript","speaker":"bot","text":"Hello","is_final":true}"#)
                .unwrap();
        assert_eq!(
            event,
            ServerEvent::Transcript {
                speaker: Speaker::Agent,
                text: "Hello".to_string(),
                is_final: true,
            }
        );
    }

    #[test]
    fn test_show_asset_with_inline_payload() {
        let json = r#"{
            "type": "show_asset",
            "asset_id": "img-1",
            "asset": {"asset_id": "img-1", "title": "Slide 1", "type": "image", "url": "/storage/a.png"},
            "start_time": 5,
            "end_time": 10
        }"#;
        match parse_server_event(json).unwrap() {
            ServerEvent::ShowAsset {
                asset_id,
                asset,
                start_time,
                end_time,
            } => {
                assert_eq!(asset_id, "img-1");
                assert_eq!(asset.unwrap().kind, AssetKind::Image);
                assert_eq!(start_time, Some(5.0));
                assert_eq!(end_time, Some(10.0));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_show_asset_minimal() {
        let event = parse_server_event(r#"{"type":"show_asset","asset_id":"img-2"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::ShowAsset {
                asset_id: "img-2".to_string(),
                asset: None,
                start_time: None,
                end_time: None,
            }
        );
    }

    #[test]
    fn test_malformed_inline_asset_keeps_event() {
        let json = r#"{
            "type": "show_asset",
            "asset_id": "img-1",
            "asset": {"asset_id": "img-1", "type": "hologram"},
            "end_time": 4
        }"#;
        assert_eq!(
            parse_server_event(json).unwrap(),
            ServerEvent::ShowAsset {
                asset_id: "img-1".to_string(),
                asset: None,
                start_time: None,
                end_time: Some(4.0),
            }
        );

        let event =
            parse_server_event(r#"{"type":"show_asset","asset_id":"img-1","asset":null}"#).unwrap();
        assert!(matches!(event, ServerEvent::ShowAsset { asset: None, .. }));
    }

    #[test]
    fn test_unit_events() {
        assert_eq!(
            parse_server_event(r#"{"type":"hide_asset"}"#).unwrap(),
            ServerEvent::HideAsset
        );
        assert_eq!(parse_server_event(r#"{"type":"pong"}"#).unwrap(), ServerEvent::Pong);
        assert_eq!(
            parse_server_event(r#"{"type":"agent_state","state":"thinking"}"#).unwrap(),
            ServerEvent::AgentState {
                state: AgentActivity::Thinking
            }
        );
    }

    #[test]
    fn test_malformed_events_are_rejected() {
        for text in [
            "not json",
            r#"{"type":"confetti"}"#,
            r#"{"speaker":"user","text":"no kind","is_final":false}"#,
            r#"{"type":"transcript","speaker":"user","is_final":false}"#,
            r#"{"type":"show_asset"}"#,
            r#"{"type":"agent_state","state":"dancing"}"#,
        ] {
            assert!(parse_server_event(text).is_err(), "accepted: {}", text);
        }
    }

    #[test]
    fn test_ping_serialization() {
        let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }
}
