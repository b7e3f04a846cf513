//! One-shot encrypted storage for in-flight ceremony state.
//!
//! A `begin` call serializes the [`CeremonySession`] into a ChaCha20-Poly1305
//! sealed browser cookie; the matching `finish` call decrypts and consumes
//! it. The ceremony kind is bound as AEAD associated data, so a registration
//! blob can never be presented to an authentication finish (or vice versa),
//! and the cookie itself scopes the state to the issuing browser session.
//!
//! Consumption is enforced twice: the caller is handed a removal cookie on
//! every `take`, and the store remembers consumed session ids until they
//! expire, so replaying a captured blob against the same process fails.

use crate::firewall::error::GateError;
use crate::webauthn::AuthenticationExtensions;
use anyhow::{anyhow, Context, Result};
use axum::http::{header::COOKIE, HeaderMap, HeaderValue};
use base64ct::{Base64UrlUnpadded, Encoding};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Minimum decoded session-key length; shorter keys are a startup-fatal
/// error.
pub const MIN_KEY_LEN: usize = 32;

/// How long a begun ceremony may wait for its finish call.
pub const SESSION_TTL_SECS: u64 = 300;

const NONCE_LEN: usize = 12;

/// The two independent ceremony flows. Sessions of different kinds never
/// collide: each kind has its own cookie and its own AEAD binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeremonyKind {
    Registration,
    Authentication,
}

impl CeremonyKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Authentication => "authentication",
        }
    }

    #[must_use]
    pub const fn cookie_name(self) -> &'static str {
        match self {
            Self::Registration => "firewall_registration_session",
            Self::Authentication => "firewall_authentication_session",
        }
    }
}

/// Ephemeral state produced by `begin` and consumed by exactly one `finish`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CeremonySession {
    /// Random session identifier, used for single-use tracking.
    pub id: String,
    pub user_id: i64,
    pub username: String,
    /// Base64url-encoded challenge the client must echo.
    pub challenge: String,
    /// Transaction extension bound at begin-time, if any.
    pub extensions: Option<AuthenticationExtensions>,
    /// Unix timestamp after which finish must be rejected.
    pub expires_at: u64,
}

impl CeremonySession {
    #[must_use]
    pub fn new(
        user_id: i64,
        username: impl Into<String>,
        challenge: String,
        extensions: Option<AuthenticationExtensions>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id,
            username: username.into(),
            challenge,
            extensions,
            expires_at: now_secs() + SESSION_TTL_SECS,
        }
    }
}

/// Keyed, one-shot, encrypted ceremony-session store backed by browser
/// cookies.
pub struct SessionStore {
    cipher: ChaCha20Poly1305,
    consumed: Mutex<HashMap<String, u64>>,
}

impl SessionStore {
    /// Build a store from the decoded session key.
    ///
    /// # Errors
    /// Returns an error if the key is shorter than [`MIN_KEY_LEN`].
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() < MIN_KEY_LEN {
            return Err(anyhow!(
                "session key not long enough: {} < {MIN_KEY_LEN}",
                key.len()
            ));
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..MIN_KEY_LEN])
            .map_err(|err| anyhow!("failed to initialize session cipher: {err}"))?;
        Ok(Self {
            cipher,
            consumed: Mutex::new(HashMap::new()),
        })
    }

    /// Seal `session` into a `Set-Cookie` header value under `kind`.
    ///
    /// # Errors
    /// Returns an error if serialization or encryption fails.
    pub fn save(&self, kind: CeremonyKind, session: &CeremonySession) -> Result<HeaderValue> {
        let plaintext = serde_json::to_vec(session).context("failed to serialize session")?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: kind.as_str().as_bytes(),
                },
            )
            .map_err(|err| anyhow!("failed to seal session: {err}"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=None; Secure; Max-Age={SESSION_TTL_SECS}",
            kind.cookie_name(),
            Base64UrlUnpadded::encode_string(&sealed)
        );
        HeaderValue::from_str(&cookie).context("failed to build session cookie")
    }

    /// Load and consume the in-flight session of `kind` from the request
    /// cookies. Consumption is unconditional: callers must also attach
    /// [`Self::removal_cookie`] to the response whether or not the subsequent
    /// verification succeeds.
    ///
    /// # Errors
    /// Returns a ceremony-state error when the session is absent, expired,
    /// already consumed, or fails to decrypt.
    pub fn take(&self, kind: CeremonyKind, headers: &HeaderMap) -> Result<CeremonySession, GateError> {
        let value = cookie_value(headers, kind.cookie_name()).ok_or_else(|| {
            GateError::ceremony(format!("no {} ceremony session found", kind.as_str()))
        })?;

        let sealed = Base64UrlUnpadded::decode_vec(&value)
            .map_err(|_| GateError::ceremony("malformed ceremony session"))?;
        if sealed.len() <= NONCE_LEN {
            return Err(GateError::ceremony("malformed ceremony session"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: kind.as_str().as_bytes(),
                },
            )
            .map_err(|_| GateError::ceremony("ceremony session failed to open"))?;

        let session: CeremonySession = serde_json::from_slice(&plaintext)
            .map_err(|_| GateError::ceremony("malformed ceremony session"))?;

        if session.expires_at <= now_secs() {
            return Err(GateError::ceremony(format!(
                "{} ceremony session expired",
                kind.as_str()
            )));
        }

        self.mark_consumed(&session)?;

        Ok(session)
    }

    /// `Set-Cookie` value that clears the session of `kind`.
    #[must_use]
    pub fn removal_cookie(kind: CeremonyKind) -> HeaderValue {
        HeaderValue::from_str(&format!(
            "{}=; Path=/; HttpOnly; SameSite=None; Secure; Max-Age=0",
            kind.cookie_name()
        ))
        .unwrap_or_else(|_| HeaderValue::from_static(""))
    }

    // Single-use bookkeeping: remember consumed ids until their natural
    // expiry so a replayed blob fails even before decryption state changes.
    fn mark_consumed(&self, session: &CeremonySession) -> Result<(), GateError> {
        let mut consumed = self
            .consumed
            .lock()
            .map_err(|_| GateError::ceremony("session store poisoned"))?;

        let now = now_secs();
        consumed.retain(|_, expires_at| *expires_at > now);

        if consumed.insert(session.id.clone(), session.expires_at).is_some() {
            return Err(GateError::ceremony("ceremony session already used"));
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let value = header.to_str().ok()?;
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next()?.trim();
            let val = parts.next()?.trim();
            if key == name {
                return Some(val.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webauthn::tx_auth_simple;

    fn store() -> SessionStore {
        SessionStore::new(&[7u8; 32]).expect("store")
    }

    fn headers_with(cookie: &HeaderValue) -> HeaderMap {
        let value = cookie.to_str().expect("cookie str");
        let pair = value.split(';').next().expect("cookie pair");
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(pair).expect("header"));
        headers
    }

    fn session() -> CeremonySession {
        CeremonySession::new(
            7,
            "alice",
            "Y2hhbGxlbmdl".to_string(),
            Some(tx_auth_simple("Confirm disable webauthn for alice")),
        )
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(SessionStore::new(&[0u8; 16]).is_err());
        assert!(SessionStore::new(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_save_take_round_trip() {
        let store = store();
        let session = session();
        let cookie = store.save(CeremonyKind::Authentication, &session).expect("save");
        let loaded = store
            .take(CeremonyKind::Authentication, &headers_with(&cookie))
            .expect("take");
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_kind_binding() {
        // A registration blob must not open as an authentication session.
        let store = store();
        let cookie = store.save(CeremonyKind::Registration, &session()).expect("save");
        let mut headers = HeaderMap::new();
        let value = cookie.to_str().expect("str");
        let blob = value
            .split(';')
            .next()
            .and_then(|pair| pair.splitn(2, '=').nth(1))
            .expect("blob");
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!(
                "{}={blob}",
                CeremonyKind::Authentication.cookie_name()
            ))
            .expect("header"),
        );
        assert!(store.take(CeremonyKind::Authentication, &headers).is_err());
    }

    #[test]
    fn test_single_use() {
        let store = store();
        let cookie = store.save(CeremonyKind::Authentication, &session()).expect("save");
        let headers = headers_with(&cookie);
        assert!(store.take(CeremonyKind::Authentication, &headers).is_ok());
        let replay = store.take(CeremonyKind::Authentication, &headers);
        assert!(replay.is_err());
        assert!(replay
            .expect_err("replay must fail")
            .to_string()
            .contains("already used"));
    }

    #[test]
    fn test_absent_session() {
        let store = store();
        let err = store
            .take(CeremonyKind::Authentication, &HeaderMap::new())
            .expect_err("missing session must fail");
        assert!(err.to_string().contains("no authentication ceremony session"));
    }

    #[test]
    fn test_expired_session() {
        let store = store();
        let mut session = session();
        session.expires_at = now_secs().saturating_sub(1);
        let cookie = store.save(CeremonyKind::Registration, &session).expect("save");
        let err = store
            .take(CeremonyKind::Registration, &headers_with(&cookie))
            .expect_err("expired session must fail");
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_tampered_blob() {
        let store = store();
        let cookie = store.save(CeremonyKind::Authentication, &session()).expect("save");
        let value = cookie.to_str().expect("str").to_string();
        let pair = value.split(';').next().expect("pair");
        let mut tampered = pair.to_string();
        tampered.pop();
        tampered.push('A');
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&tampered).expect("header"));
        assert!(store.take(CeremonyKind::Authentication, &headers).is_err());
    }

    #[test]
    fn test_concurrent_kinds_do_not_interfere() {
        let store = store();
        let registration = session();
        let authentication = session();
        let reg_cookie = store
            .save(CeremonyKind::Registration, &registration)
            .expect("save");
        let auth_cookie = store
            .save(CeremonyKind::Authentication, &authentication)
            .expect("save");

        assert!(store
            .take(CeremonyKind::Registration, &headers_with(&reg_cookie))
            .is_ok());
        assert!(store
            .take(CeremonyKind::Authentication, &headers_with(&auth_cookie))
            .is_ok());
    }
}
