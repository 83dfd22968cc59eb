//! Session state, token lifecycle and encrypted session persistence.

pub mod lifecycle;
pub mod store;
pub mod vault;

pub use lifecycle::{assess_token, AuthApi, TokenLifecycle, TokenStatus};
pub use store::{Credentials, Session, SessionEvent, SessionState, SessionStore};
pub use vault::{EncryptedFileVault, MemoryVault, SessionVault};
