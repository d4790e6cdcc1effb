//! Session lifecycle: bounded output buffering, the process-wide registry,
//! and the idempotent cleanup coordinator.

pub mod buffer;
pub mod cleanup;
pub mod registry;

pub use buffer::OutputBuffer;
pub use registry::{Session, SessionRegistry, SessionState};
