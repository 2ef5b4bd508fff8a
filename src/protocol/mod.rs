pub mod channel;
pub mod codec;
pub mod constants;
pub mod envelope;
pub mod handshake;
pub mod mux;

pub use channel::{serve_exec_requests, CommandChannel, RemoteProcess};
pub use codec::{ExecRequest, Reply, Request};
pub use constants::{Arity, CommandName};
pub use envelope::{CommandRequest, Envelope};
pub use handshake::{classify, HandshakeResult, DATASTORE_VERSION};
pub use mux::{LogicalChannel, Multiplexer};
