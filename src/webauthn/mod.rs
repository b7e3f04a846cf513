//! Step-up WebAuthn protocol: ceremony types, the engine seam, the
//! credential-record store, and the begin/finish orchestration service.

pub mod engine;
pub mod service;
pub mod store;

pub use engine::{CeremonyEngine, ChallengeEngine};
pub use service::StepUpService;
pub use store::{CredentialStore, MemoryCredentialStore, PgCredentialStore};

use std::collections::BTreeMap;

/// Extension map attached to a ceremony at begin-time and required to match
/// byte-for-byte at finish-time. Ordered so equality and display are
/// deterministic.
pub type AuthenticationExtensions = BTreeMap<String, String>;

/// The transaction-authentication extension key.
pub const TX_AUTH_SIMPLE: &str = "txAuthSimple";

/// Build the single-entry extension map binding a ceremony to a
/// human-readable confirmation string.
#[must_use]
pub fn tx_auth_simple(text: impl Into<String>) -> AuthenticationExtensions {
    let mut extensions = AuthenticationExtensions::new();
    extensions.insert(TX_AUTH_SIMPLE.to_string(), text.into());
    extensions
}

/// Identifies a principal in the credential store, mirroring the two lookup
/// paths the firewall has: a username from a form field, or a user id
/// resolved from the caller's browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserQuery {
    ByName(String),
    ById(i64),
}

/// A principal as the ceremony protocol sees it: stable integer id plus
/// display name, with the opaque stored credential when one exists. Lives for
/// one request; never persisted by the core.
#[derive(Debug, Clone)]
pub struct WebauthnUser {
    pub id: i64,
    pub name: String,
    pub credential: Option<CredentialRecord>,
}

impl WebauthnUser {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            credential: None,
        }
    }
}

/// Opaque credential produced by Finish-Registration and owned by the store.
/// The core never inspects `blob` beyond storing and returning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub credential_id: String,
    pub blob: Vec<u8>,
}
