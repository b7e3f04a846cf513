//! Ceremony orchestration: glue between the engine, the credential store,
//! and the firewall's gate. Decides when a ceremony happens at all
//! (enrollment is fail-open), checks session/principal binding, and owns the
//! transaction-extension equality check.

use crate::firewall::error::GateError;
use crate::session::CeremonySession;
use crate::webauthn::{
    AuthenticationExtensions, CeremonyEngine, CredentialStore, UserQuery, WebauthnUser,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub struct StepUpService {
    engine: Arc<dyn CeremonyEngine>,
    credentials: Arc<dyn CredentialStore>,
}

impl StepUpService {
    #[must_use]
    pub fn new(engine: Arc<dyn CeremonyEngine>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self { engine, credentials }
    }

    /// Whether the account has a credential on record. Unknown accounts are
    /// simply not enabled.
    ///
    /// # Errors
    /// Returns a dependency error when the store is unreachable.
    pub async fn is_enabled(&self, query: &UserQuery) -> Result<bool, GateError> {
        self.credentials
            .is_enabled(query)
            .await
            .map_err(GateError::dependency)
    }

    /// Begin enrolling an account.
    ///
    /// # Errors
    /// Returns an input error for an empty username or non-positive id.
    pub fn begin_registration(
        &self,
        user_id: i64,
        username: &str,
    ) -> Result<(Value, CeremonySession), GateError> {
        if username.is_empty() {
            return Err(GateError::input("username must not be empty"));
        }
        if user_id <= 0 {
            return Err(GateError::input(format!("invalid user id: {user_id}")));
        }

        debug!(user_id, username, "beginning registration ceremony");
        self.engine
            .begin_registration(&WebauthnUser::new(user_id, username))
    }

    /// Verify the attestation against the begun session and persist the
    /// resulting credential, enabling the account.
    ///
    /// # Errors
    /// Returns a verification error for a bad attestation, a dependency
    /// error when persisting fails.
    pub async fn finish_registration(
        &self,
        session: &CeremonySession,
        attestation: &str,
    ) -> Result<(), GateError> {
        let record = self.engine.finish_registration(session, attestation)?;

        let user = WebauthnUser::new(session.user_id, session.username.clone());
        self.credentials
            .create(&user, &record)
            .await
            .map_err(GateError::dependency)?;

        info!(
            user_id = session.user_id,
            username = %session.username,
            "account enrolled"
        );
        Ok(())
    }

    /// Begin an authentication ceremony, binding `extensions` into it.
    ///
    /// Fail-open for enrollment: returns `Ok(None)` when the account has no
    /// credential on record, meaning no ceremony is required and the caller
    /// proceeds without one.
    ///
    /// # Errors
    /// Returns a dependency error when the store is unreachable.
    pub async fn begin_authentication(
        &self,
        query: &UserQuery,
        extensions: Option<AuthenticationExtensions>,
    ) -> Result<Option<(Value, CeremonySession)>, GateError> {
        let Some(user) = self
            .credentials
            .get_user(query)
            .await
            .map_err(GateError::dependency)?
        else {
            debug!(?query, "account not enabled, skipping ceremony");
            return Ok(None);
        };

        let (options, session) = self.engine.begin_authentication(&user, extensions)?;
        Ok(Some((options, session)))
    }

    /// Verify an assertion against the consumed session: principal binding,
    /// client data, and byte-for-byte transaction-extension equality.
    ///
    /// `expected` is the extension map recomputed from the request being
    /// authorized; `None` falls back to what was bound at begin-time. Either
    /// way an empty expectation means the client must report none.
    ///
    /// # Errors
    /// Returns a ceremony-state error when the session belongs to a
    /// different principal, a verification error otherwise.
    pub fn verify_assertion(
        &self,
        user: &WebauthnUser,
        session: &CeremonySession,
        expected: Option<&AuthenticationExtensions>,
        assertion: &str,
    ) -> Result<(), GateError> {
        if session.user_id != user.id {
            return Err(GateError::ceremony(
                "ceremony session belongs to a different account",
            ));
        }

        let outputs = self.engine.finish_authentication(session, assertion)?;

        let expected = expected
            .cloned()
            .or_else(|| session.extensions.clone())
            .unwrap_or_default();
        if outputs != expected {
            return Err(GateError::verification("transaction extension mismatch"));
        }

        debug!(user_id = user.id, username = %user.name, "assertion verified");
        Ok(())
    }

    /// Load the account with its credential for an authentication finish.
    ///
    /// # Errors
    /// Returns a ceremony-state error when the account has no credential.
    pub async fn get_user(&self, query: &UserQuery) -> Result<WebauthnUser, GateError> {
        self.credentials
            .get_user(query)
            .await
            .map_err(GateError::dependency)?
            .ok_or_else(|| GateError::ceremony("account has no credential on record"))
    }

    /// Drop the account's credential record. Idempotent.
    ///
    /// # Errors
    /// Returns a dependency error when the store is unreachable.
    pub async fn disable(&self, username: &str) -> Result<(), GateError> {
        self.credentials
            .delete(username)
            .await
            .map_err(GateError::dependency)?;
        info!(username, "account webauthn disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webauthn::{tx_auth_simple, ChallengeEngine, MemoryCredentialStore};
    use base64ct::{Base64UrlUnpadded, Encoding};
    use serde_json::json;

    const ORIGIN: &str = "https://localhost:8081";

    fn service() -> StepUpService {
        StepUpService::new(
            Arc::new(ChallengeEngine::new("localhost", "firewall", ORIGIN)),
            Arc::new(MemoryCredentialStore::new()),
        )
    }

    fn client_data(ceremony_type: &str, challenge: &str) -> String {
        let raw = json!({ "type": ceremony_type, "challenge": challenge, "origin": ORIGIN });
        Base64UrlUnpadded::encode_string(raw.to_string().as_bytes())
    }

    fn attestation(session: &CeremonySession) -> String {
        json!({
            "id": "cred-7",
            "type": "public-key",
            "response": {
                "clientDataJSON": client_data("webauthn.create", &session.challenge),
            },
        })
        .to_string()
    }

    fn assertion(session: &CeremonySession, extensions: &Value) -> String {
        json!({
            "id": "cred-7",
            "type": "public-key",
            "response": {
                "clientDataJSON": client_data("webauthn.get", &session.challenge),
            },
            "clientExtensionResults": extensions,
        })
        .to_string()
    }

    async fn enroll(service: &StepUpService) {
        let (_, session) = service.begin_registration(7, "alice").expect("begin");
        service
            .finish_registration(&session, &attestation(&session))
            .await
            .expect("finish");
    }

    #[tokio::test]
    async fn test_enrollment_enables_account() {
        let service = service();
        let query = UserQuery::ByName("alice".to_string());
        assert!(!service.is_enabled(&query).await.expect("is_enabled"));

        enroll(&service).await;

        assert!(service.is_enabled(&query).await.expect("is_enabled"));
    }

    #[tokio::test]
    async fn test_begin_registration_validates_input() {
        let service = service();
        assert!(matches!(
            service.begin_registration(7, ""),
            Err(GateError::Input(_))
        ));
        assert!(matches!(
            service.begin_registration(0, "alice"),
            Err(GateError::Input(_))
        ));
    }

    #[tokio::test]
    async fn test_not_enabled_account_skips_ceremony() {
        let service = service();
        let begun = service
            .begin_authentication(&UserQuery::ByName("nobody".to_string()), None)
            .await
            .expect("begin");
        assert!(begun.is_none());
    }

    #[tokio::test]
    async fn test_authentication_round_trip_with_extensions() {
        let service = service();
        enroll(&service).await;

        let extensions = tx_auth_simple("Confirm repository delete: alice/demo");
        let query = UserQuery::ByName("alice".to_string());
        let (_, session) = service
            .begin_authentication(&query, Some(extensions.clone()))
            .await
            .expect("begin")
            .expect("enabled");

        let user = service.get_user(&query).await.expect("get_user");
        service
            .verify_assertion(
                &user,
                &session,
                Some(&extensions),
                &assertion(&session, &json!(extensions)),
            )
            .expect("verify");
    }

    #[tokio::test]
    async fn test_extension_mismatch_rejected() {
        let service = service();
        enroll(&service).await;

        let query = UserQuery::ByName("alice".to_string());
        let bound = tx_auth_simple("Delete SSH key named: work");
        let (_, session) = service
            .begin_authentication(&query, Some(bound.clone()))
            .await
            .expect("begin")
            .expect("enabled");

        let user = service.get_user(&query).await.expect("get_user");
        let forged = json!(tx_auth_simple("Delete SSH key named: home"));
        let err = service
            .verify_assertion(&user, &session, Some(&bound), &assertion(&session, &forged))
            .expect_err("forged extension must fail");
        assert!(matches!(err, GateError::Verification(_)));
    }

    #[tokio::test]
    async fn test_recomputed_expectation_overrides_begin_binding() {
        // The ceremony was begun for one action but the request being
        // authorized names another: the recomputed expectation decides.
        let service = service();
        enroll(&service).await;

        let query = UserQuery::ByName("alice".to_string());
        let bound = tx_auth_simple("Confirm repository delete: alice/demo");
        let (_, session) = service
            .begin_authentication(&query, Some(bound.clone()))
            .await
            .expect("begin")
            .expect("enabled");

        let user = service.get_user(&query).await.expect("get_user");
        let recomputed = tx_auth_simple("Confirm repository delete: alice/other");
        let err = service
            .verify_assertion(
                &user,
                &session,
                Some(&recomputed),
                &assertion(&session, &json!(bound)),
            )
            .expect_err("retargeted assertion must fail");
        assert!(matches!(err, GateError::Verification(_)));
    }

    #[tokio::test]
    async fn test_missing_extension_output_rejected_when_bound() {
        let service = service();
        enroll(&service).await;

        let query = UserQuery::ByName("alice".to_string());
        let bound = tx_auth_simple("Add SSH key named: x");
        let (_, session) = service
            .begin_authentication(&query, Some(bound.clone()))
            .await
            .expect("begin")
            .expect("enabled");

        let user = service.get_user(&query).await.expect("get_user");
        let err = service
            .verify_assertion(&user, &session, Some(&bound), &assertion(&session, &json!({})))
            .expect_err("missing extension output must fail");
        assert!(matches!(err, GateError::Verification(_)));
    }

    #[tokio::test]
    async fn test_unexpected_extension_output_rejected() {
        // No extension bound at begin-time: the client reporting one is a
        // mismatch, not a bonus.
        let service = service();
        enroll(&service).await;

        let query = UserQuery::ByName("alice".to_string());
        let (_, session) = service
            .begin_authentication(&query, None)
            .await
            .expect("begin")
            .expect("enabled");

        let user = service.get_user(&query).await.expect("get_user");
        let err = service
            .verify_assertion(
                &user,
                &session,
                None,
                &assertion(&session, &json!(tx_auth_simple("anything"))),
            )
            .expect_err("unexpected extension output must fail");
        assert!(matches!(err, GateError::Verification(_)));
    }

    #[tokio::test]
    async fn test_principal_binding() {
        let service = service();
        enroll(&service).await;

        let query = UserQuery::ByName("alice".to_string());
        let (_, session) = service
            .begin_authentication(&query, None)
            .await
            .expect("begin")
            .expect("enabled");

        let mallory = WebauthnUser::new(13, "mallory");
        let err = service
            .verify_assertion(&mallory, &session, None, &assertion(&session, &json!({})))
            .expect_err("cross-account session must fail");
        assert!(matches!(err, GateError::CeremonyState(_)));
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let service = service();
        enroll(&service).await;

        service.disable("alice").await.expect("disable");
        service.disable("alice").await.expect("disable again");
        assert!(!service
            .is_enabled(&UserQuery::ByName("alice".to_string()))
            .await
            .expect("is_enabled"));
    }
}
