//! The tagged message model and NDJSON batch framing.
//!
//! Message (de)serialization of the *payload* is an out-of-scope
//! external collaborator's concern (§1); this module only owns the
//! transport-level envelope (`OutboundMessage`) and the wire framing
//! rule that concatenates serialized messages with `\n` (§6).

use serde::{Deserialize, Serialize};

/// Soft cap on a single room-service text message, matching a typical
/// homeserver/ircd message size limit (§6 of SPEC_FULL.md).
pub const MAX_BATCH_BYTES: usize = 50 * 1024;

/// Dispatch tag replacing runtime `isinstance` checks (§9 design note).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Resent until the application's outbound queue no longer lists
    /// `message_identifier`.
    Retryable {
        message_identifier: u64,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Acknowledges receipt of a retryable message. Sent once.
    Delivered { delivered_message_identifier: u64 },
    /// Keepalive, sent once.
    Ping,
    /// Keepalive reply, sent once.
    Pong,
}

impl OutboundMessage {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutboundMessage::Retryable { .. })
    }

    /// `message_identifier` for retryable messages, used to match
    /// against the application's live outbound queue (§4.1).
    pub fn message_identifier(&self) -> Option<u64> {
        match self {
            OutboundMessage::Retryable { message_identifier, .. } => Some(*message_identifier),
            _ => None,
        }
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("OutboundMessage always serializes")
    }

    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Splits pre-serialized message texts into NDJSON batches no larger
/// than [`MAX_BATCH_BYTES`]. Never splits a single message; never
/// leaves a trailing newline (§6).
pub fn make_message_batches<I, S>(texts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut batches = Vec::new();
    let mut current = String::new();

    for text in texts {
        let text = text.as_ref();
        let additional = if current.is_empty() { text.len() } else { text.len() + 1 };

        if !current.is_empty() && current.len() + additional > MAX_BATCH_BYTES {
            batches.push(std::mem::take(&mut current));
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(text);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// Splits an incoming NDJSON body into parsed messages. Malformed
/// lines are dropped (caller logs a warning) rather than poisoning the
/// rest of the batch (§6).
pub fn parse_ndjson_body(body: &str) -> Vec<OutboundMessage> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match OutboundMessage::parse_line(line) {
            Ok(msg) => Some(msg),
            Err(err) => {
                tracing::warn!(error = %err, line, "dropping malformed message line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u64) -> OutboundMessage {
        OutboundMessage::Retryable {
            message_identifier: id,
            payload: serde_json::json!({"n": id}),
        }
    }

    #[test]
    fn batches_never_split_a_single_message_and_have_no_trailing_newline() {
        let texts: Vec<String> = (0..3).map(|i| sample(i).serialize()).collect();
        let batches = make_message_batches(texts.clone());
        assert_eq!(batches.len(), 1);
        assert!(!batches[0].ends_with('\n'));
        for text in &texts {
            assert!(batches[0].contains(text));
        }
    }

    #[test]
    fn batches_respect_the_soft_cap() {
        let big_payload = "x".repeat(MAX_BATCH_BYTES - 100);
        let msg = OutboundMessage::Retryable {
            message_identifier: 1,
            payload: serde_json::json!(big_payload),
        };
        let texts = vec![msg.serialize(), msg.serialize(), msg.serialize()];
        let batches = make_message_batches(texts);
        assert!(batches.len() >= 2);
        for batch in &batches {
            assert!(batch.len() <= MAX_BATCH_BYTES || !batch.contains('\n'));
        }
    }

    #[test]
    fn ndjson_roundtrip_for_well_formed_messages() {
        let msgs = vec![sample(1), OutboundMessage::Delivered { delivered_message_identifier: 1 }, OutboundMessage::Ping];
        let texts: Vec<String> = msgs.iter().map(|m| m.serialize()).collect();
        let batch = make_message_batches(texts).join("\n");
        let parsed = parse_ndjson_body(&batch);
        assert_eq!(parsed, msgs);
    }

    #[test]
    fn malformed_lines_are_dropped_not_fatal() {
        let body = format!("{}\nnot json\n{}", sample(1).serialize(), OutboundMessage::Ping.serialize());
        let parsed = parse_ndjson_body(&body);
        assert_eq!(parsed, vec![sample(1), OutboundMessage::Ping]);
    }
}
