//! Line-delimited JSON broadcast server.
//!
//! Clients connect over TCP and exchange [`envelope::Envelope`]s, one JSON
//! object per line. The server hands every event to an application supplied
//! [`handler::ReactionHandler`] and broadcasts whatever it returns to all
//! connected clients.
//!
//! - [`envelope`] defines the wire type and the line codec.
//! - [`registry`] assigns client identifiers and owns the writer half of every
//!   live connection behind a single lock; broadcasts go through it.
//! - [`server`] runs the accept loop and one dispatch loop per connection.
//! - [`handler`] is the trait applications implement; [`relay`] is the one
//!   the binary ships with.
//! - [`client`] wraps a single outbound connection; [`console`] drives it
//!   from a terminal.
//! - [`cli`] parses the command-line interface.

pub mod cli;
pub mod client;
pub mod console;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod registry;
pub mod relay;
pub mod server;

pub use client::{Client, Incoming};
pub use envelope::Envelope;
pub use error::{ClientError, RegistryError};
pub use handler::ReactionHandler;
pub use registry::{ClientId, Registry};
pub use server::{Server, ServerHandle, start};
