pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod status;

pub use error::{SessionError, SetupError};
pub use proxy::{
    build_dispatchers, run, BackendLease, BackendTarget, Bootstrap, Dispatcher, DispatcherStats,
    ListenerContext, ListenerGroup, ReverseState, Selection, Server, Session, SessionReport,
};
pub use status::{publish_status, StatusBoard, StatusSink};
