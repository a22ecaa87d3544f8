//! Session lifecycle management for Berth.
//!
//! A session owns exactly one workspace directory under the configured root,
//! an ordered list of checkpoints (snapshots under `<root>/.checkpoints/`),
//! and key/value labels. Records are persisted through a [`SessionStore`];
//! [`SqliteSessionStore`] is the durable implementation.

pub mod manager;
pub mod session;
pub mod snapshot;
pub mod store;

pub use manager::{SessionManager, SessionManagerConfig, CHECKPOINT_DIR};
pub use session::{
    Checkpoint, GcReport, Session, SessionConfig, SessionFilter, SessionListing, SessionState,
    SessionStats, SessionSummary, SessionUpdate,
};
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};
