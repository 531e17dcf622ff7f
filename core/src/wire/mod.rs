//! Wire formats: the bulk-data frame codec and the control-message envelope.
//!
//! Bulk frames and acks travel on data connections between sender, relays,
//! and receiver. Control messages travel on coordinator and pairing
//! connections. Both codecs work over any async byte stream so tests can
//! substitute in-memory pipes.

mod frame;
mod msg;

pub use frame::{
    is_valid_frame_size, read_ack, read_frame, write_ack, write_frame, Ack, Frame, MAX_PAYLOAD,
    VERSION,
};
pub use msg::{
    read_message, write_message, Message, NewRecvStream, NewRecvStreamResp, NewSendStream,
    NewSendStreamResp, ReceiveFile, ReceiveFileResp, RegisterRelay, RegisterRelayResp, SendFile,
    SendFileResp,
};
