//! Byte-stream transport for a [`Connection`].
//!
//! Each connection gets two tasks:
//!
//! - a reader that pulls bytes, splits them into packets, decodes frames and
//!   hands them to [`Connection::on_frame`]
//! - a writer that drains the outbound queue, encodes frames and writes
//!   packets
//!
//! Both stop when the connection closes. End of stream or an I/O error
//! closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use protocol::{Frame, MsgPackSerializer, PacketCodec, PeerId, ProtocolError, Result, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, RequestHandler};
use crate::router::Router;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How frames are turned into bytes.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub serializer: Arc<dyn Serializer>,
    pub codec: PacketCodec,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            serializer: Arc::new(MsgPackSerializer),
            codec: PacketCodec::new(),
        }
    }
}

/// Reader and writer tasks of one transport.
#[derive(Debug)]
pub struct TransportHandle {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TransportHandle {
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }

    /// Wait for both tasks to finish.
    pub async fn join(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

/// Start driving `connection` over `stream`.
pub fn spawn<S>(
    connection: Arc<Connection>,
    outbound: mpsc::Receiver<Frame>,
    stream: S,
    handler: Arc<dyn RequestHandler>,
    options: TransportOptions,
) -> TransportHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = tokio::spawn(write_loop(
        Arc::clone(&connection),
        outbound,
        write_half,
        options.clone(),
    ));
    let reader = tokio::spawn(read_loop(connection, read_half, handler, options));
    TransportHandle { reader, writer }
}

async fn write_loop<W>(
    connection: Arc<Connection>,
    mut outbound: mpsc::Receiver<Frame>,
    mut writer: W,
    options: TransportOptions,
) where
    W: AsyncWrite + Unpin,
{
    let shutdown = connection.shutdown_token();
    loop {
        // Queued frames go out before the shutdown is noticed, so a reply
        // sent just before close still reaches the peer.
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let packet = match options
            .serializer
            .encode_frame(&frame)
            .and_then(|body| options.codec.encode(&body))
        {
            Ok(packet) => packet,
            Err(e) => {
                warn!(stream_id = frame.stream_id, error = %e, "dropping frame that failed to encode");
                continue;
            }
        };

        if let Err(e) = writer.write_all(&packet).await {
            connection.close(&format!("write failed: {}", e)).await;
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!(peer = ?connection.peer_id(), "writer stopped");
}

async fn read_loop<R>(
    connection: Arc<Connection>,
    mut reader: R,
    handler: Arc<dyn RequestHandler>,
    options: TransportOptions,
) where
    R: AsyncRead + Unpin,
{
    let shutdown = connection.shutdown_token();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                connection.close("peer disconnected").await;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let err = ProtocolError::from(e);
                connection.close(&format!("read failed: {}", err)).await;
                break;
            }
        }

        loop {
            match options.codec.decode_from(&mut buf) {
                Ok(Some(body)) => match options.serializer.decode_frame(&body) {
                    Ok(frame) => connection.on_frame(frame, Arc::clone(&handler)).await,
                    Err(e) => connection.on_malformed(e).await,
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = ?connection.peer_id(), error = %e, "unrecoverable framing error");
                    connection.close(&format!("framing error: {}", e)).await;
                    return;
                }
            }
        }
    }
    debug!(peer = ?connection.peer_id(), "reader stopped");
}

/// Dial `addr` and complete the handshake.
pub async fn connect_tcp(router: &Router, addr: &str, timeout: Duration) -> Result<PeerId> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::Timeout(format!("connecting to {} took longer than {:?}", addr, timeout)))??;
    stream.set_nodelay(true)?;
    let peer = router.connect_stream(stream).await?;
    info!(%addr, %peer, "connected");
    Ok(peer)
}

/// Accept connections on `listener` until `shutdown` is cancelled.
pub async fn serve_tcp(router: Router, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?local, peer_id = %router.uid(), "listening");

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%remote, error = %e, "could not disable nagle");
        }
        match router.accept_stream(stream) {
            Ok(_) => debug!(%remote, "accepted transport"),
            Err(e) => warn!(%remote, error = %e, "could not accept transport"),
        }
    }

    info!("listener stopped");
    Ok(())
}
