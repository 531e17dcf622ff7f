//! Full-duplex byte copy between two paired connections.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use freighter_core::limit::TokenBucket;

use crate::traffic::TrafficMeter;

/// Read chunk for the metered direction; matches the bucket burst.
const COPY_CHUNK: usize = 16 * 1024;

/// Shuttles bytes between the two halves of a pairing until either side
/// goes away. Bulk data flowing sender → receiver passes through the
/// rate limiter and the traffic meter; acks flowing back are copied
/// verbatim.
pub async fn splice<A, B>(
    sender: A,
    receiver: B,
    limiter: Arc<TokenBucket>,
    meter: Arc<TrafficMeter>,
) where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut from_sender, mut to_sender) = tokio::io::split(sender);
    let (mut from_receiver, mut to_receiver) = tokio::io::split(receiver);

    let forward = async {
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = match from_sender.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            limiter.consume(n as u64).await;
            meter.add(n as u64);
            if to_receiver.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = to_receiver.shutdown().await;
    };

    let backward = async {
        let _ = tokio::io::copy(&mut from_receiver, &mut to_sender).await;
        let _ = to_sender.shutdown().await;
    };

    tokio::join!(forward, backward);
}
