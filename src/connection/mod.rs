//! Loopback socket transport to the engine
//!
//! The bridge binds one [`EngineListener`] for its whole lifetime and every
//! engine child connects back to the same port. Each accepted stream becomes a
//! [`Connection`] with a writer task fed by a bounded send queue and a reader
//! task that decodes frames and forwards them to the control loop.
//!
//! Connections are tagged with the supervisor generation that produced them so
//! that events from a connection that has since been replaced can be ignored.

use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{self, commands};
use crate::types::Frame;
use crate::{BridgeError, Result};


/// Loopback listening endpoint the engine connects back to.
#[derive(Debug)]
pub struct EngineListener {
    listener: TcpListener,
    port: u16,
}

impl EngineListener {
    /// Bind an ephemeral port on 127.0.0.1
    pub async fn bind() -> Result<Self> {
        Self::bind_port(0).await
    }

    /// Bind a specific port on 127.0.0.1 (0 picks one)
    pub async fn bind_port(port: u16) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::io_error(format!("binding {}", addr), e))?;
        let port = listener
            .local_addr()
            .map_err(|e| BridgeError::io_error("reading listener address", e))?
            .port();
        info!(port, "Engine listener bound");
        Ok(Self { listener, port })
    }

    /// Port the engine must be told to connect to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next engine connection
    pub async fn accept(&self) -> Result<TcpStream> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| BridgeError::io_error("accepting engine connection", e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on engine socket: {}", e);
        }
        debug!(%peer, "Engine connected");
        Ok(stream)
    }
}

/// Inbound traffic from a connection, tagged with its generation.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete frame, in the order the engine wrote it
    Frame { generation: u64, frame: Frame },
    /// The stream failed or the peer closed it; the connection is already closed
    Closed { generation: u64, error: BridgeError },
}

impl ConnectionEvent {
    pub fn generation(&self) -> u64 {
        match self {
            ConnectionEvent::Frame { generation, .. }
            | ConnectionEvent::Closed { generation, .. } => *generation,
        }
    }
}

/// Tuning for a single connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Inbound payload cap
    pub max_frame_bytes: u32,
    /// Send queue depth at which `send` suspends
    pub send_queue_depth: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { max_frame_bytes: protocol::DEFAULT_MAX_FRAME_BYTES, send_queue_depth: 1024 }
    }
}

/// One full-duplex engine connection.
///
/// Dropping the connection closes it.
#[derive(Debug)]
pub struct Connection {
    generation: u64,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl Connection {
    /// Start the reader and writer tasks for an accepted stream.
    ///
    /// Inbound frames and the terminal close are delivered on `events`.
    /// The connection is also closed when `parent` is cancelled.
    pub fn spawn(
        stream: TcpStream,
        generation: u64,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        parent: &CancellationToken,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::channel(options.send_queue_depth.max(1));
        let cancel = parent.child_token();

        tokio::spawn(Self::reader_task(
            read_half,
            generation,
            options.max_frame_bytes,
            events.clone(),
            cancel.clone(),
        ));
        tokio::spawn(Self::writer_task(write_half, generation, queue, events, cancel.clone()));

        debug!(generation, "Connection tasks started");
        Self { generation, outbound, cancel }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame for sending.
    ///
    /// Suspends while the send queue is full. Fails with `TransportClosed`
    /// once the connection is closed.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::transport_closed("connection closed"));
        }
        let command_id = frame.command_id;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BridgeError::transport_closed("connection closed")),
            sent = self.outbound.send(frame) => {
                sent.map_err(|_| BridgeError::transport_closed("writer stopped"))?;
                trace!(generation = self.generation, "Queued {}", commands::label(command_id));
                Ok(())
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(generation = self.generation, "Closing connection");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn reader_task(
        mut reader: OwnedReadHalf,
        generation: u64,
        max_frame_bytes: u32,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        cancel: CancellationToken,
    ) {
        let mut frame_count = 0u64;

        let error = loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(generation, "Reader cancelled after {} frames", frame_count);
                    return;
                }
                result = protocol::read_frame(&mut reader, max_frame_bytes) => result,
            };

            match result {
                Ok(Some(frame)) => {
                    frame_count += 1;
                    if events.send(ConnectionEvent::Frame { generation, frame }).is_err() {
                        debug!(generation, "Event receiver dropped, stopping reader");
                        return;
                    }
                }
                Ok(None) => break BridgeError::transport_closed("engine closed the connection"),
                Err(e) => break e,
            }
        };

        if cancel.is_cancelled() {
            return;
        }
        if error.is_protocol_violation() {
            warn!(generation, "Protocol violation from engine: {}", error);
        } else {
            info!(generation, "Engine connection ended: {}", error);
        }
        cancel.cancel();
        let _ = events.send(ConnectionEvent::Closed { generation, error });
    }

    async fn writer_task(
        writer: OwnedWriteHalf,
        generation: u64,
        mut queue: mpsc::Receiver<Frame>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        cancel: CancellationToken,
    ) {
        let mut writer = BufWriter::new(writer);

        let result: Result<()> = async {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    frame = queue.recv() => match frame {
                        Some(frame) => frame,
                        None => return Ok(()),
                    },
                };
                protocol::write_frame(&mut writer, &frame).await?;
                // Flush once the queue is drained so bursts go out in one write
                if queue.is_empty() {
                    writer.flush().await?;
                }
            }
        }
        .await;

        match result {
            Ok(()) => {
                let _ = writer.shutdown().await;
                debug!(generation, "Writer stopped");
            }
            Err(error) => {
                if cancel.is_cancelled() {
                    return;
                }
                info!(generation, "Engine write failed: {}", error);
                cancel.cancel();
                let _ = events.send(ConnectionEvent::Closed { generation, error });
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
