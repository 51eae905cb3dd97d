// Authentication module
// Session token lifecycle: decoding, storage, scheduled renewal and
// single-flight refresh

pub mod codec;
mod clock;
pub(crate) mod coordinator;
mod credentials;
mod manager;
mod refresh;
mod types;

pub use clock::{format_remaining, ActionKind, Countdown, ScheduledAction, SessionClock, Timebase};
pub use coordinator::{RefreshCoordinator, RefreshObserver};
pub use credentials::{CredentialStore, MemoryStore, SqliteStore};
pub use manager::SessionManager;
pub use refresh::{AuthBackend, HttpAuthBackend, MockAuthBackend, MOCK_REFRESH_TOKEN};
pub use types::{Claims, SessionPolicy, SessionSnapshot, StoredTokens, TokenPair};
