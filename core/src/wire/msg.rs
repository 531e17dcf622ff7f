//! Control-message envelope used on coordinator and pairing connections.
//!
//! Every control message is a single discriminator byte followed by a
//! length-prefixed UTF-8 JSON body:
//!
//! ```text
//! | kind:u8 | length:u32 BE | json_body[length] |
//! ```
//!
//! The discriminator set is closed. Unknown JSON fields are ignored and
//! missing fields default, so either side can be upgraded first.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const TYPE_REGISTER_RELAY: u8 = b'a';
const TYPE_REGISTER_RELAY_RESP: u8 = b'b';
const TYPE_SEND_FILE: u8 = b'c';
const TYPE_SEND_FILE_RESP: u8 = b'd';
const TYPE_RECEIVE_FILE: u8 = b'e';
const TYPE_RECEIVE_FILE_RESP: u8 = b'f';
const TYPE_NEW_SEND_STREAM: u8 = b'g';
const TYPE_NEW_SEND_STREAM_RESP: u8 = b'h';
const TYPE_NEW_RECV_STREAM: u8 = b'i';
const TYPE_NEW_RECV_STREAM_RESP: u8 = b'j';
const TYPE_PING: u8 = b'y';
const TYPE_PONG: u8 = b'z';

/// Upper bound on a control-message body.
const MAX_BODY_LEN: usize = 1 << 20;

/// Relay announcing itself to the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterRelay {
    pub version: String,
    pub bind_port: u16,
    pub public_ip: String,
}

/// Coordinator's answer to a registration. Empty `error` means accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterRelayResp {
    pub error: String,
}

/// Sender announcing a transfer to the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendFile {
    pub id: String,
    pub name: String,
    pub fsize: u64,
    pub cache_count: u32,
}

/// Match result returned to the sender.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendFileResp {
    pub id: String,
    pub workers: Vec<String>,
    pub cache_count: u32,
    pub error: String,
}

/// Receiver asking the coordinator for a matching sender.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveFile {
    pub id: String,
    pub cache_count: u32,
}

/// Match result returned to the receiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveFileResp {
    pub name: String,
    pub fsize: u64,
    pub workers: Vec<String>,
    pub cache_count: u32,
    pub error: String,
}

/// Sender-side half-connection announcing itself to a relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewSendStream {
    pub id: String,
}

/// Relay's answer on the sender-side half-connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewSendStreamResp {
    pub error: String,
}

/// Receiver-side half-connection announcing itself to a relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewRecvStream {
    pub id: String,
}

/// Relay's answer on the receiver-side half-connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewRecvStreamResp {
    pub error: String,
}

/// A control message, one variant per discriminator.
#[derive(Debug, Clone)]
pub enum Message {
    RegisterRelay(RegisterRelay),
    RegisterRelayResp(RegisterRelayResp),
    SendFile(SendFile),
    SendFileResp(SendFileResp),
    ReceiveFile(ReceiveFile),
    ReceiveFileResp(ReceiveFileResp),
    NewSendStream(NewSendStream),
    NewSendStreamResp(NewSendStreamResp),
    NewRecvStream(NewRecvStream),
    NewRecvStreamResp(NewRecvStreamResp),
    Ping,
    Pong,
}

impl Message {
    fn kind(&self) -> u8 {
        match self {
            Message::RegisterRelay(_) => TYPE_REGISTER_RELAY,
            Message::RegisterRelayResp(_) => TYPE_REGISTER_RELAY_RESP,
            Message::SendFile(_) => TYPE_SEND_FILE,
            Message::SendFileResp(_) => TYPE_SEND_FILE_RESP,
            Message::ReceiveFile(_) => TYPE_RECEIVE_FILE,
            Message::ReceiveFileResp(_) => TYPE_RECEIVE_FILE_RESP,
            Message::NewSendStream(_) => TYPE_NEW_SEND_STREAM,
            Message::NewSendStreamResp(_) => TYPE_NEW_SEND_STREAM_RESP,
            Message::NewRecvStream(_) => TYPE_NEW_RECV_STREAM,
            Message::NewRecvStreamResp(_) => TYPE_NEW_RECV_STREAM_RESP,
            Message::Ping => TYPE_PING,
            Message::Pong => TYPE_PONG,
        }
    }

    fn body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Message::RegisterRelay(m) => serde_json::to_vec(m)?,
            Message::RegisterRelayResp(m) => serde_json::to_vec(m)?,
            Message::SendFile(m) => serde_json::to_vec(m)?,
            Message::SendFileResp(m) => serde_json::to_vec(m)?,
            Message::ReceiveFile(m) => serde_json::to_vec(m)?,
            Message::ReceiveFileResp(m) => serde_json::to_vec(m)?,
            Message::NewSendStream(m) => serde_json::to_vec(m)?,
            Message::NewSendStreamResp(m) => serde_json::to_vec(m)?,
            Message::NewRecvStream(m) => serde_json::to_vec(m)?,
            Message::NewRecvStreamResp(m) => serde_json::to_vec(m)?,
            Message::Ping | Message::Pong => b"{}".to_vec(),
        };
        Ok(body)
    }
}

/// Writes one control message to the stream.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = msg.body()?;

    let mut head = [0u8; 5];
    head[0] = msg.kind();
    head[1..5].copy_from_slice(&(body.len() as u32).to_be_bytes());

    w.write_all(&head).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one control message from the stream.
pub async fn read_message<R>(r: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 5];
    r.read_exact(&mut head).await?;

    let kind = head[0];
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_BODY_LEN {
        return Err(Error::protocol("control message body too large"));
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;

    fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(body)?)
    }

    let msg = match kind {
        TYPE_REGISTER_RELAY => Message::RegisterRelay(parse(&body)?),
        TYPE_REGISTER_RELAY_RESP => Message::RegisterRelayResp(parse(&body)?),
        TYPE_SEND_FILE => Message::SendFile(parse(&body)?),
        TYPE_SEND_FILE_RESP => Message::SendFileResp(parse(&body)?),
        TYPE_RECEIVE_FILE => Message::ReceiveFile(parse(&body)?),
        TYPE_RECEIVE_FILE_RESP => Message::ReceiveFileResp(parse(&body)?),
        TYPE_NEW_SEND_STREAM => Message::NewSendStream(parse(&body)?),
        TYPE_NEW_SEND_STREAM_RESP => Message::NewSendStreamResp(parse(&body)?),
        TYPE_NEW_RECV_STREAM => Message::NewRecvStream(parse(&body)?),
        TYPE_NEW_RECV_STREAM_RESP => Message::NewRecvStreamResp(parse(&body)?),
        TYPE_PING => Message::Ping,
        TYPE_PONG => Message::Pong,
        other => {
            return Err(Error::protocol(format!(
                "unknown control message kind 0x{other:02x}"
            )))
        }
    };
    Ok(msg)
}
