//! Mutual hello exchange run on every freshly opened transport path.
//!
//! Both sides send their signed hello immediately, then verify the
//! peer's. The dialing side pins the peer id it resolved; the listening
//! side learns the id from the hello itself. Nothing after the
//! handshake trusts an unverified byte.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use passage_proto::limits::MAX_HELLO_SIZE;
use passage_proto::wire::{parse_probe, Hello};
use passage_proto::{unix_now, NodeKeypair, PeerId};

use crate::error::{NetError, Result};
use crate::transport::{read_frame, write_frame};

/// Runs the mutual hello over a fresh stream.
///
/// `expected` pins the peer id on the dialing side; `None` accepts any
/// correctly signed identity (listener side). Returns the verified peer
/// id.
pub(crate) async fn exchange_hello<S>(
    stream: &mut S,
    keypair: &NodeKeypair,
    expected: Option<&PeerId>,
) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Hello::new(keypair, unix_now());
    let bytes = ours
        .to_bytes()
        .map_err(|e| NetError::Handshake(format!("failed to encode hello: {}", e)))?;
    write_frame(stream, &bytes).await?;

    let theirs = read_frame(stream, MAX_HELLO_SIZE).await?;
    let hello = Hello::from_bytes(&theirs)
        .map_err(|e| NetError::Handshake(format!("malformed hello: {}", e)))?;
    hello
        .verify(expected, unix_now())
        .map_err(|e| NetError::Handshake(e.to_string()))
}

/// Milliseconds between hello retransmissions on datagram paths.
const HELLO_RESEND_MS: u64 = 200;

/// Runs the mutual hello over a connected datagram socket.
///
/// Same exchange as [`exchange_hello`], but one datagram carries one
/// hello and no length prefix is used. The hello is retransmitted until
/// the peer's arrives, since the first copy can race path selection and
/// be consumed by the peer's probe loop. Connectivity probes still in
/// flight are skipped rather than treated as a malformed hello.
pub(crate) async fn exchange_hello_datagram(
    socket: &tokio::net::UdpSocket,
    keypair: &NodeKeypair,
    expected: Option<&PeerId>,
) -> Result<PeerId> {
    let ours = Hello::new(keypair, unix_now());
    let bytes = ours
        .to_bytes()
        .map_err(|e| NetError::Handshake(format!("failed to encode hello: {}", e)))?;

    let mut buf = vec![0u8; MAX_HELLO_SIZE];
    let mut resend = tokio::time::interval(Duration::from_millis(HELLO_RESEND_MS));
    loop {
        tokio::select! {
            _ = resend.tick() => {
                socket.send(&bytes).await?;
            }
            received = socket.recv(&mut buf) => {
                let n = received?;
                if parse_probe(&buf[..n]).is_some() {
                    continue;
                }
                let hello = Hello::from_bytes(&buf[..n])
                    .map_err(|e| NetError::Handshake(format!("malformed hello: {}", e)))?;
                return hello
                    .verify(expected, unix_now())
                    .map_err(|e| NetError::Handshake(e.to_string()));
            }
        }
    }
}
