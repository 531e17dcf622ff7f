//! Transport pipeline for relayed file transfer.
//!
//! A sender and a receiver meet through a coordinator and stream file data
//! over one or more relay nodes. This crate holds the pieces shared by all
//! roles:
//!
//! - [`wire`]: the bulk frame codec and the control-message envelope
//! - [`sender`]: the sending pipeline with per-relay adaptive windows
//! - [`receiver`]: out-of-order reassembly into an ordered byte stream
//! - [`limit`]: token-bucket byte rate limiting
//! - [`tls`]: the opportunistic TLS configuration used on every connection

pub mod error;
pub mod io;
pub mod limit;
pub mod receiver;
pub mod sender;
pub mod tls;
pub mod wire;

pub use error::{Error, Result};
pub use receiver::Receiver;
pub use sender::Sender;
pub use wire::{Ack, Frame, Message, VERSION};
