//! ks-server: KeySocket relay server library.
//!
//! Bridges browser WebSocket terminals to SSH shells under a hard memory
//! ceiling: bounded per-session output buffers, an idle-session reaper, a
//! memory governor, and an idempotent cleanup path shared by every
//! teardown trigger.

pub mod config;
pub mod health;
pub mod memory;
pub mod reaper;
pub mod relay;
pub mod server;
pub mod session;
pub mod shell;
pub mod transport;

pub use relay::RelayService;
pub use server::RelayServer;
pub use session::cleanup::cleanup;
pub use session::registry::{Session, SessionRegistry, SessionState};
