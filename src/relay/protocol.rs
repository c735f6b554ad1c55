//! Relay wire format: every frame is `{"event": <name>, "data": <payload>}`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Auth(String),
    JoinSession(String),
    UpgradePrivileges(String),
    SetSessionState(u8),
    JoinChannel(Vec<String>),
    LeaveChannel(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    SessionConflict,
    SessionNotFound,
    NotPermitted,
    InvalidState,
    InvalidToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Hello {
        #[serde(rename = "relayEndpoint")]
        relay_endpoint: String,
        debug: bool,
    },
    Upgraded(bool),
    SessionId(String),
    Error(String),
    #[serde(rename = "errorType")]
    ErrorType(ErrorType),
}

/// Anything queued for a single connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    /// A chunk from a `sid:stream` channel.
    Data { channel: String, chunk: Bytes },
}

impl Outbound {
    pub fn to_json(&self) -> String {
        match self {
            Outbound::Event(event) => serde_json::to_string(event).unwrap_or_default(),
            Outbound::Data { channel, chunk } => json!({
                "event": channel,
                "data": STANDARD.encode(chunk),
            })
            .to_string(),
        }
    }
}

impl From<ServerEvent> for Outbound {
    fn from(event: ServerEvent) -> Self {
        Outbound::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn client_events_parse() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"upgrade_privileges","data":"s3cret"}"#).unwrap();
        assert_eq!(ev, ClientEvent::UpgradePrivileges("s3cret".into()));
        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"join_channel","data":["a:stdout","a:stderr"]}"#)
                .unwrap();
        assert_eq!(
            ev,
            ClientEvent::JoinChannel(vec!["a:stdout".into(), "a:stderr".into()])
        );
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"nope","data":1}"#).is_err());
    }

    #[test]
    fn server_frames() {
        let hello: Value = serde_json::from_str(
            &Outbound::from(ServerEvent::Hello {
                relay_endpoint: "ws://x".into(),
                debug: true,
            })
            .to_json(),
        )
        .unwrap();
        assert_eq!(hello["event"], "hello");
        assert_eq!(hello["data"]["relayEndpoint"], "ws://x");

        let frame = Outbound::from(ServerEvent::ErrorType(ErrorType::SessionConflict));
        let err: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(err["event"], "errorType");
        assert_eq!(err["data"], "sessionConflict");

        let data: Value = serde_json::from_str(
            &Outbound::Data {
                channel: "sid:stdout".into(),
                chunk: Bytes::from_static(b"hi"),
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(data["event"], "sid:stdout");
        assert_eq!(data["data"], "aGk=");
    }
}
