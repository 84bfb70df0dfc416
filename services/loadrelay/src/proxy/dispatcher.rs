//! Accept loops and process bootstrap.
//!
//! Each listening port gets a [`Dispatcher`] that accepts connections and
//! spawns one [`Session`] per connection. Sessions are not tracked after
//! spawn; a session ends only when its own relay ends, so there is no
//! graceful drain.

use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::ListenerContext;
use super::server::Server;
use super::session::Session;
use crate::error::{SessionError, SetupError};
use crate::status::{publish_status, StatusSink};

/// Counters for one dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Accept calls that returned an error.
    pub accept_errors: AtomicU64,
    /// Sessions currently running.
    pub sessions_active: AtomicU64,
    /// Sessions that have finished, successfully or not.
    pub sessions_completed: AtomicU64,
    /// Sessions that ended before relaying (no backend or connect failure).
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// Accept loop for one listening port.
pub struct Dispatcher {
    context: Arc<ListenerContext>,
    listener: TcpListener,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(context: Arc<ListenerContext>, listener: TcpListener) -> Self {
        Self {
            context,
            listener,
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    /// Wrap a pre-opened listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(
        context: Arc<ListenerContext>,
        listener: std::net::TcpListener,
    ) -> Result<Self, SetupError> {
        let port = context.port();
        let listener = listener
            .set_nonblocking(true)
            .and_then(|()| TcpListener::from_std(listener))
            .map_err(|source| SetupError::WrapListener { port, source })?;
        Ok(Self::new(context, listener))
    }

    /// Get the local address this dispatcher accepts on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The listener context sessions are bound to.
    pub fn context(&self) -> &Arc<ListenerContext> {
        &self.context
    }

    /// Get dispatcher statistics.
    pub fn stats(&self) -> &Arc<DispatcherStats> {
        &self.stats
    }

    /// Accept connections forever.
    ///
    /// Accept errors are logged and the loop continues immediately.
    pub async fn run(self) {
        let listen_port = self.context.port();
        info!(listen_port, "Dispatcher started");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(listen_port, error = %e, "Accept error");
                    continue;
                }
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);

            let session = Session::new(stream, peer_addr, Arc::clone(&self.context));
            let stats = Arc::clone(&self.stats);

            tokio::spawn(
                run_session(session, stats)
                    .instrument(tracing::info_span!("session", peer = %peer_addr, listen_port)),
            );
        }
    }
}

async fn run_session(session: Session, stats: Arc<DispatcherStats>) {
    stats.sessions_active.fetch_add(1, Ordering::Relaxed);
    debug!("Session opened");

    match session.run().await {
        Ok(report) => {
            stats
                .bytes_to_backend
                .fetch_add(report.bytes_to_backend, Ordering::Relaxed);
            stats
                .bytes_from_backend
                .fetch_add(report.bytes_to_client, Ordering::Relaxed);

            match &report.error {
                Some(e) => debug!(
                    backend_port = report.backend_port,
                    reason = e.reason_code(),
                    error = %e,
                    bytes_to_backend = report.bytes_to_backend,
                    bytes_from_backend = report.bytes_to_client,
                    "Session ended with relay error"
                ),
                None => debug!(
                    backend_port = report.backend_port,
                    bytes_to_backend = report.bytes_to_backend,
                    bytes_from_backend = report.bytes_to_client,
                    "Session closed"
                ),
            }
        }
        Err(e @ SessionError::NoBackend) => {
            stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            error!(reason = e.reason_code(), error = %e, "Session aborted");
        }
        Err(e) => {
            stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            warn!(reason = e.reason_code(), error = %e, "Session aborted");
        }
    }

    stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
    stats.sessions_completed.fetch_add(1, Ordering::Relaxed);
}

/// Listening ports with their pre-opened sockets and shared backend pool.
#[derive(Debug)]
pub struct ListenerGroup {
    /// Group name used in errors and logs.
    pub name: &'static str,
    /// Listening ports, parallel to `listeners`.
    pub ports: Vec<u16>,
    /// Pre-opened listening sockets.
    pub listeners: Vec<std::net::TcpListener>,
    /// Backend ports; every listening port of the group gets its own pool of these.
    pub backend_ports: Vec<u16>,
}

impl ListenerGroup {
    /// A group with no listeners.
    pub fn empty(name: &'static str) -> Self {
        Self {
            name,
            ports: Vec::new(),
            listeners: Vec::new(),
            backend_ports: Vec::new(),
        }
    }

    /// Bind one listening socket per port on `bind_ip`.
    ///
    /// Port 0 binds an ephemeral port; the recorded port is the one assigned.
    pub fn bind(
        name: &'static str,
        bind_ip: IpAddr,
        ports: &[u16],
        backend_ports: Vec<u16>,
    ) -> Result<Self, SetupError> {
        let mut bound_ports = Vec::with_capacity(ports.len());
        let mut listeners = Vec::with_capacity(ports.len());

        for &port in ports {
            let addr = SocketAddr::new(bind_ip, port);
            let listener = std::net::TcpListener::bind(addr)
                .map_err(|source| SetupError::Bind { addr, source })?;
            let local = listener
                .local_addr()
                .map_err(|source| SetupError::Bind { addr, source })?;
            bound_ports.push(local.port());
            listeners.push(listener);
        }

        Ok(Self {
            name,
            ports: bound_ports,
            listeners,
            backend_ports,
        })
    }

    fn validate(&self) -> Result<(), SetupError> {
        if self.ports.len() != self.listeners.len() {
            return Err(SetupError::MismatchedListeners {
                group: self.name,
                ports: self.ports.len(),
                listeners: self.listeners.len(),
            });
        }
        if !self.listeners.is_empty() && self.backend_ports.is_empty() {
            return Err(SetupError::EmptyBackendPool { group: self.name });
        }
        Ok(())
    }
}

/// Everything the relay needs to start serving.
#[derive(Debug)]
pub struct Bootstrap {
    pub primary: ListenerGroup,
    pub auxiliary: ListenerGroup,
}

/// Validate both groups and wrap every listening socket.
///
/// Nothing is spawned; an error leaves no dispatcher running.
pub fn build_dispatchers(
    bootstrap: Bootstrap,
    server: &Arc<Server>,
) -> Result<Vec<Dispatcher>, SetupError> {
    let Bootstrap { primary, auxiliary } = bootstrap;
    primary.validate()?;
    auxiliary.validate()?;

    let mut dispatchers = Vec::with_capacity(primary.ports.len() + auxiliary.ports.len());
    for group in [primary, auxiliary] {
        for (port, listener) in group.ports.iter().copied().zip(group.listeners) {
            let context = Arc::new(ListenerContext::new(
                port,
                &group.backend_ports,
                Arc::clone(server),
            ));
            dispatchers.push(Dispatcher::from_std(context, listener)?);
        }
    }
    Ok(dispatchers)
}

/// Start every dispatcher and publish status forever.
///
/// Returns only if setup fails.
pub async fn run(
    bootstrap: Bootstrap,
    server: Arc<Server>,
    sink: Arc<dyn StatusSink>,
    status_interval: Duration,
) -> Result<Infallible, SetupError> {
    let dispatchers = build_dispatchers(bootstrap, &server)?;

    for dispatcher in dispatchers {
        info!(
            listen_port = dispatcher.context().port(),
            backend_ports = ?dispatcher.context().backend_ports(),
            "Listener ready"
        );
        tokio::spawn(dispatcher.run());
    }

    Ok(publish_status(&server, sink.as_ref(), status_interval).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_mismatched_listener_lists_are_rejected() {
        let server = Arc::new(Server::new("test"));
        let mut primary = ListenerGroup::bind("primary", LOCALHOST, &[0], vec![9000]).unwrap();
        primary.ports.push(1234);

        let err = build_dispatchers(
            Bootstrap {
                primary,
                auxiliary: ListenerGroup::empty("auxiliary"),
            },
            &server,
        )
        .err()
        .unwrap();

        assert!(matches!(
            err,
            SetupError::MismatchedListeners {
                group: "primary",
                ports: 2,
                listeners: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_group_without_backends_is_rejected() {
        let server = Arc::new(Server::new("test"));
        let auxiliary = ListenerGroup::bind("auxiliary", LOCALHOST, &[0], Vec::new()).unwrap();

        let err = build_dispatchers(
            Bootstrap {
                primary: ListenerGroup::empty("primary"),
                auxiliary,
            },
            &server,
        )
        .err()
        .unwrap();

        assert_eq!(err.reason_code(), "empty_backend_pool");
    }

    #[tokio::test]
    async fn test_each_port_gets_its_own_pool() {
        let server = Arc::new(Server::new("test"));
        let primary = ListenerGroup::bind("primary", LOCALHOST, &[0, 0], vec![9000, 9001]).unwrap();
        let auxiliary = ListenerGroup::bind("auxiliary", LOCALHOST, &[0], vec![9100]).unwrap();
        let expected_ports: Vec<u16> = primary
            .ports
            .iter()
            .chain(auxiliary.ports.iter())
            .copied()
            .collect();

        let dispatchers = build_dispatchers(Bootstrap { primary, auxiliary }, &server).unwrap();
        assert_eq!(dispatchers.len(), 3);

        let ports: Vec<u16> = dispatchers.iter().map(|d| d.context().port()).collect();
        assert_eq!(ports, expected_ports);
        for (dispatcher, port) in dispatchers.iter().zip(&expected_ports) {
            assert_eq!(dispatcher.local_addr().unwrap().port(), *port);
        }

        assert_eq!(dispatchers[0].context().backend_ports(), vec![9000, 9001]);
        assert_eq!(dispatchers[2].context().backend_ports(), vec![9100]);

        let selection = dispatchers[0].context().choose().unwrap();
        assert_eq!(dispatchers[1].context().loads(), vec![0, 0]);
        assert_eq!(server.load(), 1);
        dispatchers[0].context().release(selection).unwrap();
    }
}
