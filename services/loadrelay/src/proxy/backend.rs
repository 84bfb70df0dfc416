//! Backend pool management and selection.
//!
//! Each listening port owns a [`ListenerContext`] holding an ordered pool of
//! backend targets on the local host. Sessions are assigned to the least
//! loaded target; ties go to the target configured first.
//!
//! A selection is a move-only [`Selection`] token. Releasing consumes it, so a
//! slot cannot be returned twice, and a context refuses tokens it did not
//! issue. Sessions hold their token inside a [`BackendLease`], which returns
//! the slot when dropped.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::server::Server;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One backend service instance and its in-flight session count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendTarget {
    port: u16,
    load: usize,
}

impl BackendTarget {
    fn new(port: u16) -> Self {
        Self { port, load: 0 }
    }

    /// Backend port on the local host.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sessions currently assigned to this target.
    pub fn load(&self) -> usize {
        self.load
    }

    /// Get the socket address for this backend.
    pub fn socket_addr(&self) -> SocketAddr {
        local_addr(self.port)
    }
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Proof that a backend slot was taken from a specific context.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a selection holds a backend slot until it is released"]
pub struct Selection {
    context_id: u64,
    index: usize,
    port: u16,
}

impl Selection {
    /// Port of the selected backend.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// One listening port and the backend pool it relays to.
#[derive(Debug)]
pub struct ListenerContext {
    id: u64,
    port: u16,
    targets: Mutex<Vec<BackendTarget>>,
    server: Arc<Server>,
}

impl ListenerContext {
    /// Create a context for `port` relaying to `backend_ports`, in order.
    pub fn new(port: u16, backend_ports: &[u16], server: Arc<Server>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            port,
            targets: Mutex::new(backend_ports.iter().copied().map(BackendTarget::new).collect()),
            server,
        }
    }

    /// Listening port this context serves.
    pub fn port(&self) -> u16 {
        self.port
    }

    // Nothing panics while the lock is held, so a poisoned pool is still consistent.
    fn targets(&self) -> MutexGuard<'_, Vec<BackendTarget>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot on the least loaded backend.
    ///
    /// Returns `None` only when the pool is empty.
    pub fn choose(&self) -> Option<Selection> {
        let mut targets = self.targets();
        let (index, target) = targets
            .iter_mut()
            .enumerate()
            .min_by_key(|(_, target)| target.load)?;

        target.load += 1;
        self.server.increment();

        debug!(
            listen_port = self.port,
            backend_port = target.port,
            backend_load = target.load,
            "Backend selected"
        );

        Some(Selection {
            context_id: self.id,
            index,
            port: target.port,
        })
    }

    /// Return a slot taken by [`choose`](Self::choose).
    ///
    /// A selection issued by another context is handed back unchanged and no
    /// counter is touched.
    pub fn release(&self, selection: Selection) -> Result<(), Selection> {
        if selection.context_id != self.id {
            return Err(selection);
        }

        let mut targets = self.targets();
        match targets.get_mut(selection.index) {
            Some(target) if target.port == selection.port && target.load > 0 => {
                target.load -= 1;
                self.server.decrement();
                Ok(())
            }
            _ => Err(selection),
        }
    }

    /// Take a slot wrapped in a guard that releases it on drop.
    pub fn lease(self: &Arc<Self>) -> Option<BackendLease> {
        let selection = self.choose()?;
        Some(BackendLease {
            port: selection.port(),
            context: Arc::clone(self),
            selection: Some(selection),
        })
    }

    /// Backend ports in selection tie-break order.
    pub fn backend_ports(&self) -> Vec<u16> {
        self.targets().iter().map(BackendTarget::port).collect()
    }

    /// Per-backend loads, in the same order as [`backend_ports`](Self::backend_ports).
    pub fn loads(&self) -> Vec<usize> {
        self.targets().iter().map(BackendTarget::load).collect()
    }

    /// Sum of this context's backend loads.
    pub fn total_load(&self) -> usize {
        self.targets().iter().map(BackendTarget::load).sum()
    }
}

/// A backend slot held for the lifetime of a session.
#[derive(Debug)]
pub struct BackendLease {
    context: Arc<ListenerContext>,
    port: u16,
    selection: Option<Selection>,
}

impl BackendLease {
    /// Port of the leased backend.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address to connect to for the leased backend.
    pub fn socket_addr(&self) -> SocketAddr {
        local_addr(self.port)
    }

    /// Return the slot now instead of at drop.
    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        if let Some(selection) = self.selection.take() {
            if let Err(selection) = self.context.release(selection) {
                warn!(
                    listen_port = self.context.port(),
                    backend_port = selection.port(),
                    "Lease refused by its own context"
                );
            }
        }
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.release_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn context(ports: &[u16]) -> (Arc<Server>, ListenerContext) {
        let server = Arc::new(Server::new("test"));
        let ctx = ListenerContext::new(7000, ports, Arc::clone(&server));
        (server, ctx)
    }

    #[test]
    fn test_backend_socket_addr() {
        let target = BackendTarget::new(9000);
        assert_eq!(target.socket_addr().to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_tie_break_and_depletion() {
        let (server, ctx) = context(&[100, 101, 102]);

        let a = ctx.choose().unwrap();
        assert_eq!(a.port(), 100);
        assert_eq!(ctx.loads(), vec![1, 0, 0]);
        assert_eq!(server.load(), 1);

        let b = ctx.choose().unwrap();
        assert_eq!(b.port(), 101);
        assert_eq!(ctx.loads(), vec![1, 1, 0]);
        assert_eq!(server.load(), 2);

        let c = ctx.choose().unwrap();
        assert_eq!(c.port(), 102);
        assert_eq!(ctx.loads(), vec![1, 1, 1]);
        assert_eq!(server.load(), 3);

        ctx.release(b).unwrap();
        assert_eq!(ctx.loads(), vec![1, 0, 1]);
        assert_eq!(server.load(), 2);

        let d = ctx.choose().unwrap();
        assert_eq!(d.port(), 101);
        assert_eq!(ctx.loads(), vec![1, 1, 1]);
        assert_eq!(server.load(), 3);
    }

    #[test]
    fn test_choose_on_empty_pool() {
        let (server, ctx) = context(&[]);
        assert!(ctx.choose().is_none());
        assert_eq!(server.load(), 0);
    }

    #[test]
    fn test_round_trip_restores_loads() {
        let (server, ctx) = context(&[100, 101]);
        let _held = ctx.choose().unwrap();
        let before = ctx.loads();

        let selection = ctx.choose().unwrap();
        ctx.release(selection).unwrap();

        assert_eq!(ctx.loads(), before);
        assert_eq!(server.load(), 1);
    }

    #[test]
    fn test_release_from_foreign_context_is_refused() {
        let server = Arc::new(Server::new("test"));
        let first = ListenerContext::new(7000, &[100, 101], Arc::clone(&server));
        let second = ListenerContext::new(7001, &[100, 101], Arc::clone(&server));

        let selection = first.choose().unwrap();
        let _other = second.choose().unwrap();

        let returned = second.release(selection).unwrap_err();
        assert_eq!(first.loads(), vec![1, 0]);
        assert_eq!(second.loads(), vec![1, 0]);
        assert_eq!(server.load(), 2);

        first.release(returned).unwrap();
        assert_eq!(first.loads(), vec![0, 0]);
        assert_eq!(server.load(), 1);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let server = Arc::new(Server::new("test"));
        let ctx = Arc::new(ListenerContext::new(7000, &[100, 101], Arc::clone(&server)));

        let lease = ctx.lease().unwrap();
        assert_eq!(lease.port(), 100);
        assert_eq!(server.load(), 1);

        let second = ctx.lease().unwrap();
        assert_eq!(second.port(), 101);
        second.release();
        assert_eq!(ctx.loads(), vec![1, 0]);

        drop(lease);
        assert_eq!(ctx.loads(), vec![0, 0]);
        assert_eq!(server.load(), 0);
    }

    #[test]
    fn test_concurrent_choose_release_conserves_load() {
        let server = Arc::new(Server::new("test"));
        let contexts: Vec<_> = (0..3)
            .map(|i| ListenerContext::new(7000 + i, &[100, 101, 102], Arc::clone(&server)))
            .collect();

        std::thread::scope(|scope| {
            for ctx in &contexts {
                for _ in 0..4 {
                    scope.spawn(move || {
                        for _ in 0..500 {
                            let selection = ctx.choose().unwrap();
                            ctx.release(selection).unwrap();
                        }
                    });
                }
            }
        });

        assert_eq!(server.load(), 0);
        for ctx in &contexts {
            assert_eq!(ctx.loads(), vec![0, 0, 0]);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Choose(usize),
        Release(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize).prop_map(Op::Choose),
            (0..3usize, any::<usize>()).prop_map(|(c, i)| Op::Release(c, i)),
        ]
    }

    proptest! {
        #[test]
        fn prop_selection_matches_first_minimum(
            pools in proptest::collection::vec(proptest::collection::vec(1u16..=u16::MAX, 1..6), 3),
            ops in proptest::collection::vec(op(), 0..200),
        ) {
            let server = Arc::new(Server::new("prop"));
            let contexts: Vec<_> = pools
                .iter()
                .enumerate()
                .map(|(i, ports)| ListenerContext::new(8000 + i as u16, ports, Arc::clone(&server)))
                .collect();
            let mut held: Vec<Vec<Selection>> = vec![Vec::new(), Vec::new(), Vec::new()];

            for op in ops {
                match op {
                    Op::Choose(c) => {
                        let before = contexts[c].loads();
                        let expected = before
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, load)| **load)
                            .map(|(i, _)| i)
                            .unwrap();
                        let server_before = server.load();

                        let selection = contexts[c].choose().unwrap();
                        prop_assert_eq!(selection.port(), pools[c][expected]);

                        let after = contexts[c].loads();
                        prop_assert_eq!(after[expected], before[expected] + 1);
                        prop_assert_eq!(server.load(), server_before + 1);
                        held[c].push(selection);
                    }
                    Op::Release(c, i) => {
                        if held[c].is_empty() {
                            continue;
                        }
                        let len = held[c].len();
                        let selection = held[c].swap_remove(i % len);
                        let before = contexts[c].loads();
                        let server_before = server.load();
                        let index = selection.index;

                        // Every other context must refuse it.
                        let mut selection = selection;
                        for (other, ctx) in contexts.iter().enumerate() {
                            if other != c {
                                selection = ctx.release(selection).unwrap_err();
                            }
                        }
                        prop_assert_eq!(server.load(), server_before);

                        contexts[c].release(selection).unwrap();
                        let after = contexts[c].loads();
                        prop_assert_eq!(after[index], before[index] - 1);
                        prop_assert_eq!(server.load(), server_before - 1);
                    }
                }

                let total: usize = contexts.iter().map(ListenerContext::total_load).sum();
                prop_assert_eq!(server.load(), total);
            }
        }
    }
}
