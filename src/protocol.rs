//! Wire protocol for the validator chat service
//!
//! One WebSocket carries every conversation. Outbound traffic is an
//! action envelope with a JSON-encoded body; inbound traffic is a closed
//! set of frame kinds discriminated by a `type` field. Keeping the inbound
//! side a single tagged enum means the router dispatches with an
//! exhaustive match instead of string comparisons.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire timestamp (RFC 3339), the format the service produces and expects.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

// ============================================================================
// Outbound
// ============================================================================

/// Actions the client may issue over the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    HumanInput,
    TaskToken,
    CustomAssertion,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::HumanInput => "human_input",
            Action::TaskToken => "task_token",
            Action::CustomAssertion => "custom_assertion",
        }
    }
}

/// Outbound envelope: `{action, session, body}` where `body` is itself a
/// JSON-encoded string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    pub session: String,
    pub body: String,
}

/// Body for the `human_input` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanInputBody {
    pub chat_id: String,
    pub chat_ts: String,
    pub ts: String,
    pub human_input: String,
    pub extra: String,
}

/// Body for the `task_token` action, presenting a continuation token back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveTokenBody {
    pub ts: String,
    pub chat_ts: String,
    pub id: String,
    pub chat_id: String,
    pub task_token: String,
}

/// Body for the `custom_assertion` action (free-typed assertion text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomAssertionBody {
    pub chat_id: String,
    pub chat_ts: String,
    pub ts: String,
    pub assertion: String,
    pub extra: String,
    #[serde(rename = "statementId", skip_serializing_if = "Option::is_none")]
    pub statement_id: Option<String>,
}

// ============================================================================
// Inbound
// ============================================================================

/// Every frame the service sends, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Stream(StreamFrame),
    TaskToken(TokenFrame),
    Assertions(AssertionsFrame),
    Evidence(EvidenceFrame),
    /// Legacy whole-statement delivery. Statements travel as streams; this
    /// kind is kept so the sum stays closed, and dropped on receipt.
    Statement(StatementFrame),
}

/// One chunk of an in-progress statement. An empty `message` is the
/// end-of-stream sentinel; `extra` carries the correlation key of the
/// utterance that started the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub id: String,
    pub chat_id: String,
    pub message: String,
    pub extra: String,
}

/// Which derivation step a continuation token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Statement,
    Assertions,
}

/// A continuation token for `id`'s next derivation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFrame {
    pub id: String,
    pub chat_id: String,
    pub task_token: String,
    pub step_type: StepKind,
    pub ts: String,
    pub chat_ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// Assertions derived from a statement. The service reuses one frame shape
/// for the success and error variants; `error` is populated on failure and
/// the parallel `ids`/`assertions` sequences on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionsFrame {
    pub ts: String,
    pub chat_id: String,
    pub chat_ts: String,
    pub statement_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<String>,
}

impl AssertionsFrame {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The (id, text) pairs of the derived assertions.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ids
            .iter()
            .zip(self.assertions.iter())
            .map(|(id, text)| (id.as_str(), text.as_str()))
    }
}

/// Evidence derived for one assertion. `extra` is set when the evidence was
/// requested for a free-typed assertion rather than a listed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceFrame {
    pub ts: String,
    pub chat_ts: String,
    pub chat_id: String,
    pub id: String,
    pub assertion_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvidenceFrame {
    /// The key the router resolves and caches under.
    pub fn correlation_id(&self) -> &str {
        self.extra.as_deref().unwrap_or(&self.assertion_id)
    }
}

/// Legacy whole-statement frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementFrame {
    pub ts: String,
    pub chat_id: String,
    pub chat_ts: String,
    pub id: String,
    pub statement: String,
    pub extra: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_input_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Evidence payload
// ============================================================================

/// The evidence map: a fixed summary pair plus one entry per evidence item.
/// The summary fields are named fields here, so iterating `items` never
/// yields them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(rename = "Summary")]
    pub summary: String,
    #[serde(rename = "Final Verdict")]
    pub final_verdict: String,
    #[serde(flatten)]
    pub items: BTreeMap<String, EvidenceItem>,
}

/// One scored piece of evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Score")]
    pub score: String,
    #[serde(rename = "Verdict")]
    pub verdict: String,
    #[serde(rename = "Explanation")]
    pub explanation: String,
    #[serde(rename = "leap_url")]
    pub source_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_shape_matches_wire() {
        let env = Envelope {
            action: Action::HumanInput,
            session: "s-1".to_string(),
            body: "{\"x\":1}".to_string(),
        };
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"action": "human_input", "session": "s-1", "body": "{\"x\":1}"})
        );
    }

    #[test]
    fn stream_frame_decodes() {
        let raw = json!({
            "type": "stream",
            "id": "st-1",
            "chat_id": "c-1",
            "message": "Hel",
            "extra": "corr-9"
        });
        let frame: Inbound = serde_json::from_value(raw).unwrap();
        match frame {
            Inbound::Stream(s) => {
                assert_eq!(s.id, "st-1");
                assert_eq!(s.message, "Hel");
                assert_eq!(s.extra, "corr-9");
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn token_frame_round_trips() {
        let raw = json!({
            "type": "task_token",
            "id": "st-1",
            "chat_id": "c-1",
            "task_token": "opaque",
            "step_type": "assertions",
            "ts": "2024-01-01T00:00:00Z",
            "chat_ts": "2024-01-01T00:00:00Z"
        });
        let frame: Inbound = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&frame).unwrap(), raw);
    }

    #[test]
    fn assertions_error_variant_decodes() {
        let raw = json!({
            "type": "assertions",
            "ts": "t",
            "chat_id": "c-1",
            "chat_ts": "t",
            "statement_id": "st-1",
            "extra": "e",
            "error": "No assertions were generated"
        });
        let frame: Inbound = serde_json::from_value(raw).unwrap();
        match frame {
            Inbound::Assertions(a) => {
                assert!(a.is_error());
                assert!(a.ids.is_empty());
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn assertions_entries_pair_ids_with_text() {
        let frame = AssertionsFrame {
            ts: "t".into(),
            chat_id: "c".into(),
            chat_ts: "t".into(),
            statement_id: "st".into(),
            extra: None,
            error: None,
            ids: vec!["a-1".into(), "a-2".into()],
            assertions: vec!["first".into(), "second".into()],
        };
        let entries: Vec<_> = frame.entries().collect();
        assert_eq!(entries, vec![("a-1", "first"), ("a-2", "second")]);
    }

    #[test]
    fn evidence_summary_fields_stay_out_of_items() {
        let raw = json!({
            "type": "evidence",
            "ts": "t",
            "chat_ts": "t",
            "chat_id": "c-1",
            "id": "ev-1",
            "assertion_id": "a-1",
            "evidence": {
                "Summary": "mostly true",
                "Final Verdict": "supported",
                "Item 1": {
                    "ID": "i-1",
                    "Score": "0.92",
                    "Verdict": "supports",
                    "Explanation": "matches the source",
                    "leap_url": "https://example.com/src"
                }
            }
        });
        let frame: Inbound = serde_json::from_value(raw).unwrap();
        let Inbound::Evidence(ev) = frame else {
            panic!("wrong kind");
        };
        let evidence = ev.evidence.unwrap();
        assert_eq!(evidence.summary, "mostly true");
        assert_eq!(evidence.final_verdict, "supported");
        assert_eq!(evidence.items.len(), 1);
        assert_eq!(evidence.items["Item 1"].source_url, "https://example.com/src");
    }

    #[test]
    fn evidence_correlation_prefers_extra() {
        let frame = EvidenceFrame {
            ts: "t".into(),
            chat_ts: "t".into(),
            chat_id: "c".into(),
            id: "ev".into(),
            assertion_id: "a-1".into(),
            extra: Some("custom-7".into()),
            evidence: None,
            error: None,
        };
        assert_eq!(frame.correlation_id(), "custom-7");

        let listed = EvidenceFrame {
            extra: None,
            ..frame
        };
        assert_eq!(listed.correlation_id(), "a-1");
    }

    #[test]
    fn unknown_frame_kind_fails_to_decode() {
        let raw = json!({"type": "heartbeat", "id": "x"});
        assert!(serde_json::from_value::<Inbound>(raw).is_err());
    }
}
