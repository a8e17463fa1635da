use serde_json::json;

use crate::{envelope::Envelope, handler::ReactionHandler, registry::ClientId};

/// Reaction handler used by the `serve` command.
///
/// Announces arrivals and departures and re-broadcasts every message tagged
/// with its sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct Relay;

impl ReactionHandler for Relay {
    fn client_connected(&self, id: ClientId) -> Vec<Envelope> {
        vec![Envelope::new("joined", json!({ "client": id }))]
    }

    fn client_disconnected(&self, id: ClientId) -> Vec<Envelope> {
        vec![Envelope::new("left", json!({ "client": id }))]
    }

    fn handle_message(&self, id: ClientId, envelope: Envelope) -> Vec<Envelope> {
        let Envelope { kind, payload } = envelope;
        vec![Envelope::new(kind, json!({ "from": id, "payload": payload }))]
    }
}
