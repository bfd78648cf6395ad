mod handler;
mod message;
mod router;

pub use handler::ws_handler;
pub use message::{
    ClientMessage, ErrorCode, FailureData, MessageType, OutboundMessage, PeerLog, ServerMessage,
};
pub use router::{Dispatch, PeerRouter, RelayOutcome};
