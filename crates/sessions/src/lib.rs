//! Per-conversation session registry, eviction, idle sweep, and durable
//! cross-restart resume.

mod dead;
mod persistence;
mod registry;
mod session;

pub use dead::DeadSessionRecord;
pub use persistence::{PersistedEntry, PersistenceStore};
pub use registry::{CreateSessionParams, ListedSession, SessionRegistry, SessionRegistryConfig};
pub use session::Session;
