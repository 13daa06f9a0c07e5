//! LanChat host runtime: tokio sockets, file I/O and the session API around `lanchat_core`.

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod files;
pub mod session;
pub mod transport;

pub use config::Config;
pub use session::{Session, SessionError};

use lanchat_core::Millis;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> Millis {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or(0)
}
