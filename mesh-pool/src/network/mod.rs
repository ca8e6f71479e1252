// Network module for manager/worker links
//
// This module provides the wire framing (length-prefixed CBOR) and the
// tag-multiplexed session used by both sides of the pool protocol.

mod protocol;
mod session;

pub use protocol::{
    read_frame, write_frame, Frame, Message, Tag, MESSAGE_SIZE_LIMIT, PROTOCOL_VERSION,
};
pub use session::{is_disconnect, unexpected, BoxedLink, Link, Session};
