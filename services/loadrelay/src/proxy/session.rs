//! Per-connection relay.
//!
//! A session owns one accepted client connection. It leases a backend slot,
//! connects to the backend and relays bytes in both directions:
//!
//! ```text
//! client --(reverse task)--> backend
//! client <--(session task)-- backend
//! ```
//!
//! The reverse direction runs as its own task. It reports readiness over a
//! oneshot channel, stops when its cancellation token fires, and cancels a
//! second token when it exits for any reason. The session task ends its own
//! direction as soon as that happens, so a client that closes or resets ends
//! the session even if the backend keeps its side open. The session task
//! always cancels and joins the reverse task before it releases the backend
//! slot and closes the sockets, whichever way its own direction ended.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

use super::backend::ListenerContext;
use crate::error::SessionError;

/// Read buffer size for each relay direction.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// How the client-to-backend direction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseState {
    /// The task ended before it signalled readiness.
    NeverStarted,
    /// The task ran and was joined before cleanup.
    Stopped,
    /// The task panicked or was aborted.
    Lost,
}

/// Summary of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    /// Backend the session was relayed to.
    pub backend_port: u16,
    /// Bytes copied from client to backend.
    pub bytes_to_backend: u64,
    /// Bytes copied from backend to client.
    pub bytes_to_client: u64,
    /// Final state of the client-to-backend task.
    pub reverse: ReverseState,
    /// Terminal error of the backend-to-client direction, if any.
    pub error: Option<SessionError>,
}

/// One accepted client connection bound to its listener context.
pub struct Session {
    client: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<ListenerContext>,
}

impl Session {
    pub fn new(client: TcpStream, peer_addr: SocketAddr, context: Arc<ListenerContext>) -> Self {
        Self {
            client,
            peer_addr,
            context,
        }
    }

    /// Relay the connection until either direction ends.
    ///
    /// Returns `Err` only when no relay could be set up (no backend, or the
    /// backend refused the connection). The backend slot is released on
    /// every path.
    pub async fn run(self) -> Result<SessionReport, SessionError> {
        let Session {
            client,
            peer_addr,
            context,
        } = self;

        let lease = context.lease().ok_or(SessionError::NoBackend)?;
        let backend_port = lease.port();

        let backend = TcpStream::connect(lease.socket_addr())
            .await
            .map_err(|source| SessionError::BackendConnect {
                port: backend_port,
                source,
            })?;

        debug!(peer = %peer_addr, backend_port, "Connected to backend");

        for stream in [&client, &backend] {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let (client_read, mut client_write) = client.into_split();
        let (mut backend_read, backend_write) = backend.into_split();

        let mut reverse = ReverseRelay::spawn(client_read, backend_write);

        let (bytes_to_client, error) = if reverse.wait_started().await {
            relay_forward(&mut backend_read, &mut client_write, &reverse.done).await
        } else {
            (0, None)
        };

        let (reverse_state, bytes_to_backend, halves) = reverse.stop().await;

        lease.release();
        drop(halves);
        drop(backend_read);
        drop(client_write);

        Ok(SessionReport {
            backend_port,
            bytes_to_backend,
            bytes_to_client,
            reverse: reverse_state,
            error: error.map(SessionError::Relay),
        })
    }
}

/// Copy backend to client until the backend closes, an I/O call fails, or
/// the reverse direction has exited.
///
/// A zero-byte read is the backend closing its side and ends the loop
/// without an error.
async fn relay_forward(
    backend_read: &mut OwnedReadHalf,
    client_write: &mut OwnedWriteHalf,
    reverse_done: &CancellationToken,
) -> (u64, Option<io::Error>) {
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            _ = reverse_done.cancelled() => return (total, None),
            read = backend_read.read(&mut buf) => read,
        };
        match read {
            Ok(0) => return (total, None),
            Ok(n) => {
                if let Err(e) = client_write.write_all(&buf[..n]).await {
                    return (total, Some(e));
                }
                total += n as u64;
            }
            Err(e) => return (total, Some(e)),
        }
    }
}

/// Socket halves and byte count handed back by the reverse task.
struct ReverseHalves {
    client_read: OwnedReadHalf,
    backend_write: OwnedWriteHalf,
    bytes: u64,
}

/// Handle on the client-to-backend task.
struct ReverseRelay {
    started: oneshot::Receiver<()>,
    ready: bool,
    stop: CancellationToken,
    done: CancellationToken,
    task: JoinHandle<ReverseHalves>,
}

impl ReverseRelay {
    fn spawn(client_read: OwnedReadHalf, backend_write: OwnedWriteHalf) -> Self {
        let (started_tx, started) = oneshot::channel();
        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        let task = tokio::spawn(
            relay_reverse(
                client_read,
                backend_write,
                started_tx,
                stop.clone(),
                done.clone(),
            )
            .in_current_span(),
        );
        Self {
            started,
            ready: false,
            stop,
            done,
            task,
        }
    }

    /// Startup barrier. `false` if the task ended without signalling.
    async fn wait_started(&mut self) -> bool {
        self.ready = (&mut self.started).await.is_ok();
        self.ready
    }

    /// Interrupt the task and wait until it has fully stopped.
    async fn stop(self) -> (ReverseState, u64, Option<(OwnedReadHalf, OwnedWriteHalf)>) {
        self.stop.cancel();

        match self.task.await {
            Ok(halves) if self.ready => (
                ReverseState::Stopped,
                halves.bytes,
                Some((halves.client_read, halves.backend_write)),
            ),
            Ok(halves) => (
                ReverseState::NeverStarted,
                0,
                Some((halves.client_read, halves.backend_write)),
            ),
            Err(e) => {
                error!(error = %e, "Client to backend relay task failed");
                (ReverseState::Lost, 0, None)
            }
        }
    }
}

/// Copy client to backend until stopped, the client closes, or I/O fails.
///
/// Errors end the loop and are not reported further. `done` is cancelled
/// when the task exits, including by unwinding.
async fn relay_reverse(
    mut client_read: OwnedReadHalf,
    mut backend_write: OwnedWriteHalf,
    started: oneshot::Sender<()>,
    stop: CancellationToken,
    done: CancellationToken,
) -> ReverseHalves {
    let _done = done.drop_guard();
    let _ = started.send(());

    let mut bytes = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let step = async {
            let n = client_read.read(&mut buf).await?;
            if n > 0 {
                backend_write.write_all(&buf[..n]).await?;
            }
            Ok::<_, io::Error>(n)
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = step => match result {
                Ok(0) => break,
                Ok(n) => bytes += n as u64,
                Err(e) => {
                    debug!(error = %e, "Client to backend relay ended");
                    break;
                }
            },
        }
    }

    // Half-close so the backend sees the end of the client stream.
    let _ = backend_write.shutdown().await;

    ReverseHalves {
        client_read,
        backend_write,
        bytes,
    }
}
