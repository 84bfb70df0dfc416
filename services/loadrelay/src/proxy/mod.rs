//! L4 TCP relay implementation.
//!
//! This module provides:
//! - Least-loaded backend selection per listening port
//! - Process-wide session accounting
//! - Bidirectional per-connection relay
//! - Accept loops and startup wiring
//!
//! ## Architecture
//!
//! ```text
//! Client -> Dispatcher -> Session -> ListenerContext::lease -> Backend (127.0.0.1:port)
//!                            |
//!                  reverse task (client -> backend)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use loadrelay::{Bootstrap, ListenerGroup, Server, StatusBoard};
//!
//! let primary = ListenerGroup::bind("primary", bind_ip, &[8080], vec![9000, 9001])?;
//! let bootstrap = Bootstrap { primary, auxiliary: ListenerGroup::empty("auxiliary") };
//! let server = Arc::new(Server::new("loadrelay"));
//! loadrelay::run(bootstrap, server, Arc::new(StatusBoard::new()), interval).await?;
//! ```

mod backend;
mod dispatcher;
mod server;
mod session;

pub use backend::{BackendLease, BackendTarget, ListenerContext, Selection};
pub use dispatcher::{build_dispatchers, run, Bootstrap, Dispatcher, DispatcherStats, ListenerGroup};
pub use server::Server;
pub use session::{ReverseState, Session, SessionReport, RELAY_BUFFER_SIZE};
