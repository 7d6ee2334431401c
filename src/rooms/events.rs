use serde::{Deserialize, Serialize};

use crate::models::Language;

/// Frames a connected client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinSession {
        session_id: String,
    },
    LeaveSession {
        session_id: String,
    },
    CodeChange {
        session_id: String,
        #[serde(default)]
        code: String,
    },
    LanguageChange {
        session_id: String,
        language: String,
    },
}

impl ClientEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::JoinSession { session_id }
            | Self::LeaveSession { session_id }
            | Self::CodeChange { session_id, .. }
            | Self::LanguageChange { session_id, .. } => session_id,
        }
    }
}

/// Frames pushed to clients. `CodeUpdate` carries the language only as the
/// reply to a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    CodeUpdate {
        session_id: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<Language>,
    },
    LanguageUpdate {
        session_id: String,
        language: Language,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tagged_client_frames() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"code_change","session_id":"s1","code":"x = 1"}"#)
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::CodeChange {
                session_id: "s1".to_string(),
                code: "x = 1".to_string(),
            }
        );
        assert_eq!(event.session_id(), "s1");
    }

    #[test]
    fn missing_code_defaults_to_empty() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"code_change","session_id":"s1"}"#).unwrap();
        assert!(matches!(event, ClientEvent::CodeChange { code, .. } if code.is_empty()));
    }

    #[test]
    fn broadcast_code_update_omits_language() {
        let json = serde_json::to_value(ServerEvent::CodeUpdate {
            session_id: "s1".to_string(),
            code: "ab".to_string(),
            language: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "code_update", "session_id": "s1", "code": "ab"})
        );
    }

    #[test]
    fn join_reply_includes_language() {
        let json = serde_json::to_value(ServerEvent::CodeUpdate {
            session_id: "s1".to_string(),
            code: "".to_string(),
            language: Some(Language::Go),
        })
        .unwrap();
        assert_eq!(json["language"], "go");
    }
}
