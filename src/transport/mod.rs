mod error;
mod pending;
pub(crate) mod protocol;
mod reconnect;
mod session;

pub use error::TransportError;
pub use protocol::{ClientMessage, InboundMessage, LogBatch, SyncLogsPage, SyncLogsRequest};
pub use reconnect::ReconnectPolicy;
pub use session::{ConnectionStatus, Session, TransportSettings};
