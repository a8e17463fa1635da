use std::sync::Arc;

use crate::{envelope::Envelope, registry::ClientId};

/// Application behaviour plugged into the server.
///
/// Each callback returns the envelopes to broadcast in response. They go to
/// every registered client, the originating one included; there is no way to
/// address a single recipient from here. Callbacks run on the connection's
/// task, so they should return quickly.
pub trait ReactionHandler: Send + Sync + 'static {
    fn client_connected(&self, id: ClientId) -> Vec<Envelope>;

    fn client_disconnected(&self, id: ClientId) -> Vec<Envelope>;

    fn handle_message(&self, id: ClientId, envelope: Envelope) -> Vec<Envelope>;
}

impl<H: ReactionHandler> ReactionHandler for Arc<H> {
    fn client_connected(&self, id: ClientId) -> Vec<Envelope> {
        (**self).client_connected(id)
    }

    fn client_disconnected(&self, id: ClientId) -> Vec<Envelope> {
        (**self).client_disconnected(id)
    }

    fn handle_message(&self, id: ClientId, envelope: Envelope) -> Vec<Envelope> {
        (**self).handle_message(id, envelope)
    }
}
