//! Inbound envelope handling for an admitted connection.
//!
//! [`handle_inbound`] is a pure function from one raw inbound frame to what
//! the connection should do next: whether to refresh liveness and which
//! envelope, if any, to send back. The transport's read loop applies the
//! outcome through the registry.

use horizon_proto::{Envelope, ErrorNotice, Message, Pong, StatusReport};
use serde_json::Value;

/// What to do after an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundOutcome {
    /// The frame was a heartbeat: refresh the connection's liveness
    pub refresh_heartbeat: bool,
    /// Envelope to send back to the sender
    pub reply: Option<Envelope>,
}

impl InboundOutcome {
    fn heartbeat() -> Self {
        Self { refresh_heartbeat: true, reply: None }
    }

    fn reply(envelope: Envelope) -> Self {
        Self { refresh_heartbeat: false, reply: Some(envelope) }
    }
}

/// Decide how to answer one inbound frame from `identity`.
///
/// `now` is the server's ISO-8601 time, used when a status request carries
/// no timestamp of its own. Only a frame that is not a JSON object gets an
/// `error` envelope; the connection stays open either way.
pub fn handle_inbound(identity: &str, raw: &[u8], now: &str) -> InboundOutcome {
    let Ok(envelope) = Envelope::from_json(raw) else {
        return InboundOutcome::reply(error(ErrorNotice::INVALID_JSON));
    };

    match envelope.message {
        Message::Heartbeat(_) => InboundOutcome::heartbeat(),
        Message::Ping(ping) => {
            InboundOutcome::reply(Envelope::new(Message::Pong(Pong { timestamp: ping.timestamp })))
        },
        Message::StatusRequest(request) => {
            InboundOutcome::reply(Envelope::new(Message::Status(StatusReport {
                connected: true,
                identity: identity.to_string(),
                timestamp: request.timestamp.unwrap_or_else(|| Value::from(now)),
            })))
        },
        other => InboundOutcome::reply(echo(other, envelope.timestamp)),
    }
}

fn echo(message: Message, timestamp: Option<String>) -> Envelope {
    let data = match message {
        Message::Echo(data) | Message::Unknown { data, .. } => data,
        // server-originated types sent by a client
        typed => typed.data().unwrap_or_default(),
    };
    Envelope::new(Message::Echo(data)).with_timestamp(timestamp)
}

fn error(message: &str) -> Envelope {
    Envelope::new(Message::Error(ErrorNotice::new(message)))
}
