// This module contains the client side of a single transfer.
//
// A Session owns one datagram channel for its whole life. It sends the initial request to the
// server's well-known port, then runs the transfer state machine: each Action it gets back is
// carried out (send a packet, read from the source, write to the sink, wait for the peer) and the
// outcome is fed back as the next Event, until the machine completes or aborts.
//
// The first endpoint to answer becomes the peer for the rest of the transfer, as TFTP servers
// move each transfer to a fresh port. Datagrams from anywhere else get an Unknown TID error and
// are otherwise ignored.
//
// `download` and `upload` consume the session, so the channel is closed exactly once whichever way
// the transfer ends.

use crate::retry::RetryPolicy;
use crate::tftp::{self, DatagramChannel, ErrorCode, FileMode, Packet, SocketError, TftpSocket, UdpChannel};
use crate::transfer::{Action, Direction, Event, Transfer, TransferError, TransferSummary};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Settings for one client invocation.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where the initial request goes.
    pub server: SocketAddr,
    pub mode: FileMode,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server: (Ipv4Addr::LOCALHOST, tftp::DEFAULT_PORT).into(),
            mode: FileMode::default(),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Session<C> {
    sock: TftpSocket<C>,
    /// The server's request endpoint.
    server: SocketAddr,
    /// The endpoint that answered the request, once known.
    peer: Option<SocketAddr>,
    retry: RetryPolicy,
    /// Wire form of the last packet sent, kept for retransmission.
    last_sent: Vec<u8>,
}

impl Session<UdpChannel> {
    /// Opens a UDP channel on an ephemeral local port.
    pub fn connect(config: &ClientConfig) -> io::Result<Session<UdpChannel>> {
        let chan = UdpChannel::bind_ephemeral(config.server)?;
        log::debug!("Bound local socket {}", chan.local_addr()?);
        Ok(Session::new(chan, config.server, config.retry))
    }
}

impl<C: DatagramChannel> Session<C> {
    pub fn new(chan: C, server: SocketAddr, retry: RetryPolicy) -> Session<C> {
        Session {
            sock: TftpSocket::new(chan),
            server,
            peer: None,
            retry,
            last_sent: Vec::new(),
        }
    }

    /// Fetches `path` from the server, writing each block to `sink` in order.
    pub async fn download<W>(self, path: &str, mode: &str, sink: &mut W) -> Result<TransferSummary, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let request = Packet::ReadReq { path: path.to_string(), mode: mode.to_string() };
        self.run::<tokio::io::Empty, W>(Direction::Download, request, None, Some(sink))
            .await
    }

    /// Stores the contents of `source` on the server as `path`.
    pub async fn upload<R>(self, path: &str, mode: &str, source: &mut R) -> Result<TransferSummary, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let request = Packet::WriteReq { path: path.to_string(), mode: mode.to_string() };
        self.run::<R, tokio::io::Sink>(Direction::Upload, request, Some(source), None)
            .await
    }

    async fn run<R, W>(
        mut self,
        direction: Direction,
        request: Packet,
        mut source: Option<&mut R>,
        mut sink: Option<&mut W>,
    ) -> Result<TransferSummary, TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut transfer = Transfer::new(direction, self.retry);
        log::info!("Starting {}: {} to {}", direction, request, self.server);

        let mut event = match self.send(&request).await {
            Ok(()) => Event::Start,
            Err(e) => Event::Fault(e),
        };

        loop {
            event = match transfer.step(event) {
                Action::Await => self.await_reply().await,
                Action::ReadChunk => match source.as_deref_mut() {
                    Some(source) => match read_block(source).await {
                        Ok(chunk) => Event::Chunk(chunk),
                        Err(e) => Event::Fault(e.into()),
                    },
                    None => Event::Fault(TransferError::Internal("no byte source to read from".to_string())),
                },
                Action::Send(packet) => match self.send(&packet).await {
                    Ok(()) => self.await_reply().await,
                    Err(e) => Event::Fault(e),
                },
                Action::Deliver { data, ack, last } => {
                    let written = match sink.as_deref_mut() {
                        Some(sink) => write_block(sink, &data, last).await.map_err(TransferError::from),
                        None => Err(TransferError::Internal("no byte sink to write to".to_string())),
                    };
                    match written {
                        Err(e) => Event::Fault(e),
                        Ok(()) => match self.send(&ack).await {
                            Ok(()) => Event::Delivered,
                            Err(e) => Event::Fault(e),
                        },
                    }
                }
                Action::Resend { attempt } => {
                    log::warn!(
                        "Timed out after {:?}, retransmitting (attempt {} of {})",
                        self.retry.timeout,
                        attempt,
                        self.retry.max_retransmits
                    );
                    match self.resend().await {
                        Ok(()) => self.await_reply().await,
                        Err(e) => Event::Fault(e),
                    }
                }
                Action::Complete(summary) => {
                    log::info!(
                        "Finished {}: {} bytes in {} blocks",
                        direction,
                        summary.bytes,
                        summary.blocks
                    );
                    return Ok(summary);
                }
                Action::Abort(e) => {
                    log::warn!("Aborting {}: {}", direction, e);
                    self.send_courtesy_error(&e).await;
                    return Err(e);
                }
            };
        }
    }

    /// Sends a packet to the peer, or to the server's request port before anyone has answered.
    async fn send(&mut self, packet: &Packet) -> Result<(), TransferError> {
        let dst = self.peer.unwrap_or(self.server);
        self.last_sent = packet.encode()?;
        log::debug!("TX {} -> {}", packet, dst);
        self.sock.send_raw(&self.last_sent, dst).await?;
        Ok(())
    }

    async fn resend(&mut self) -> Result<(), TransferError> {
        let dst = self.peer.unwrap_or(self.server);
        self.sock.send_raw(&self.last_sent, dst).await?;
        Ok(())
    }

    /// Waits up to one timeout for a datagram from the peer.
    ///
    /// Stray datagrams from other endpoints are rejected without extending the wait.
    async fn await_reply(&mut self) -> Event {
        let deadline = Instant::now() + self.retry.timeout;
        loop {
            let (received, src) = match self.sock.recv_until(deadline).await {
                Ok((packet, src)) => (Ok(packet), src),
                Err(SocketError::Malformed(e, src)) => (Err(e), src),
                Err(SocketError::Timeout(_)) => return Event::TimedOut,
                Err(e) => return Event::Fault(e.into()),
            };

            match self.peer {
                Some(peer) if peer != src => {
                    log::warn!("Ignoring datagram from {}, transfer is bound to {}", src, peer);
                    self.reject(src).await;
                    continue;
                }
                Some(_) => {}
                None => {
                    log::info!("Server answered from {}", src);
                    self.peer = Some(src);
                }
            }

            return match received {
                Ok(packet) => {
                    log::debug!("RX {} <- {}", packet, src);
                    Event::Received(packet)
                }
                Err(e) => Event::Fault(e.into()),
            };
        }
    }

    async fn reject(&mut self, src: SocketAddr) {
        let packet = Packet::Error {
            code: ErrorCode::UnknownTid,
            message: "Unknown transfer ID".to_string(),
        };
        // Sent as a courtesy, the result doesn't matter.
        let _ = self.sock.send(&packet, src).await;
    }

    async fn send_courtesy_error(&mut self, e: &TransferError) {
        let (Some(packet), Some(peer)) = (e.courtesy_packet(), self.peer) else {
            return;
        };
        log::debug!("TX {} -> {}", packet, peer);
        // Error packet is sent as a courtesy, we don't care how it goes.
        let _ = self.sock.send(&packet, peer).await;
    }
}

/// Reads the next block from the source: a full 512 bytes unless the source runs out first.
async fn read_block<R: AsyncRead + Unpin>(source: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single read can come up short without the source being exhausted, so keep reading into
    // the remainder of the buffer until it's full or a read returns nothing.
    loop {
        let n = source.read(&mut buf[cursor..]).await?;
        cursor += n;
        if cursor == buf.len() || n == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

async fn write_block<W: AsyncWrite + Unpin>(sink: &mut W, data: &[u8], last: bool) -> io::Result<()> {
    sink.write_all(data).await?;
    if last {
        sink.flush().await?;
    }
    Ok(())
}
