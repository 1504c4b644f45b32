pub mod message;

pub use message::{
    version_compatible, ErrorCode, Frame, HandshakePayload, Message, WireError, DIGEST_LEN,
    PEER_ID_LEN, PROTOCOL_VERSION,
};
