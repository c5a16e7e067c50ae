pub mod auth;
pub mod conflict;
pub mod coordinator;
pub mod fallback;
pub mod queue;
pub mod store;
pub mod supervisor;

pub use auth::{AuthClaims, AuthError, AuthService, TokenVerifier};
pub use conflict::{
    diff_fields, merge_payloads, ConflictEngine, NoRecentChanges, RecentChangeIndex,
};
pub use coordinator::{SyncCoordinator, SyncEvent};
pub use fallback::{FallbackManager, PullSink};
pub use queue::OperationQueue;
pub use store::SqliteStore;
pub use supervisor::{ConnectionSupervisor, Session, SessionState};
