use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Control messages exchanged as JSON Text frames between the three
/// populations (agent, relay, browser). Terminal I/O never appears here -
/// it travels as Binary frames (see `frame.rs`).
///
/// `#[serde(tag = "type", rename_all = "snake_case")]` gives every variant
/// a `type` discriminator plus its own fields, flattened into the same
/// JSON object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// agent -> relay: allocate a session.
    Register { client_id: String },
    /// relay -> agent: the allocated code and its unpaired deadline.
    Registered { code: String, expires_at: i64 },

    /// browser -> relay: join an existing session.
    Auth { session_code: String },
    /// relay -> browser: join accepted.
    AuthSuccess,
    /// relay -> browser: join rejected, see `ErrorKind` for `reason`.
    AuthFailed { reason: String },

    /// relay -> browser: a shell appeared (sent once per existing shell on
    /// auth_success, and again whenever one newly registers).
    SessionConnected { session_id: String, name: String },
    /// relay -> browser: a shell vanished.
    SessionDisconnected { session_id: String },

    /// browser -> relay -> agent: resize request for a specific shell.
    TerminalResize { session_id: String, cols: u16, rows: u16 },

    /// relay -> agent: a browser joined this session.
    BrowserConnected { browser_id: String },
    /// relay -> agent: a browser left this session.
    BrowserDisconnected { browser_id: String },

    /// Liveness probe, either direction.
    Ping { ts: i64 },
    Pong { ts: i64 },

    /// relay -> any: error taxonomy.
    Error { code: String, message: String },
}

/// Encode a control message to its JSON wire form.
pub fn encode(msg: &ControlMessage) -> String {
    // Every variant here is plain data with no fallible fields, so this
    // can't fail in practice; callers that need a Result can go through
    // serde_json::to_string directly.
    serde_json::to_string(msg).expect("ControlMessage always serializes")
}

/// Decode a JSON wire frame into a control message.
///
/// Unknown `type` values and malformed JSON are both reported, but as
/// distinguishable `ProtocolError` variants.
pub fn decode(text: &str) -> Result<ControlMessage, ProtocolError> {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(msg) => Ok(msg),
        Err(e) => {
            // serde's tagged-enum error for an unrecognized "type" value
            // renders as "unknown variant `foo`, expected one of ...". We
            // surface that case as UnknownType instead of a generic parse
            // failure; anything else is genuinely malformed JSON.
            if let Some(unknown) = extract_unknown_variant(text) {
                Err(ProtocolError::UnknownType(unknown))
            } else {
                Err(ProtocolError::Malformed(e))
            }
        }
    }
}

/// Best-effort extraction of the `type` field from a JSON object, used only
/// to decide whether a decode failure was an unrecognized (but
/// otherwise-valid) tag versus genuinely malformed JSON.
fn extract_unknown_variant(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let type_field = value.get("type")?.as_str()?.to_string();
    let known = [
        "register",
        "registered",
        "auth",
        "auth_success",
        "auth_failed",
        "session_connected",
        "session_disconnected",
        "terminal_resize",
        "browser_connected",
        "browser_disconnected",
        "ping",
        "pong",
        "error",
    ];
    if known.contains(&type_field.as_str()) {
        None
    } else {
        Some(type_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ControlMessage) {
        let json = encode(&msg);
        let decoded = decode(&json).expect("roundtrip decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrips_every_variant() {
        roundtrip(ControlMessage::Register { client_id: "c1".into() });
        roundtrip(ControlMessage::Registered { code: "K4MP7X".into(), expires_at: 1_700_000_000_000 });
        roundtrip(ControlMessage::Auth { session_code: "K4MP7X".into() });
        roundtrip(ControlMessage::AuthSuccess);
        roundtrip(ControlMessage::AuthFailed { reason: "INVALID_CODE".into() });
        roundtrip(ControlMessage::SessionConnected { session_id: "sh1".into(), name: "work".into() });
        roundtrip(ControlMessage::SessionDisconnected { session_id: "sh1".into() });
        roundtrip(ControlMessage::TerminalResize { session_id: "sh1".into(), cols: 80, rows: 24 });
        roundtrip(ControlMessage::BrowserConnected { browser_id: "b1".into() });
        roundtrip(ControlMessage::BrowserDisconnected { browser_id: "b1".into() });
        roundtrip(ControlMessage::Ping { ts: 123 });
        roundtrip(ControlMessage::Pong { ts: 123 });
        roundtrip(ControlMessage::Error { code: "INTERNAL".into(), message: "oops".into() });
    }

    #[test]
    fn tag_is_snake_case() {
        let json = encode(&ControlMessage::Register { client_id: "a".into() });
        assert!(json.contains("\"type\":\"register\""));
        assert!(json.contains("\"client_id\":\"a\""));
    }

    #[test]
    fn unknown_type_is_distinguishable_from_malformed_json() {
        let unknown = decode(r#"{"type":"frobnicate"}"#);
        assert!(matches!(unknown, Err(ProtocolError::UnknownType(t)) if t == "frobnicate"));

        let malformed = decode("{not json");
        assert!(matches!(malformed, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn auth_decodes_with_expected_fields() {
        let json = r#"{"type":"auth","session_code":"XYZ789"}"#;
        match decode(json).unwrap() {
            ControlMessage::Auth { session_code } => assert_eq!(session_code, "XYZ789"),
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[test]
    fn auth_success_has_no_extra_fields() {
        assert_eq!(encode(&ControlMessage::AuthSuccess), "{\"type\":\"auth_success\"}");
    }
}
