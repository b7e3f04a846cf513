//! Ceremony engine seam.
//!
//! The engine owns everything challenge-shaped: minting begin-time options
//! payloads for the browser and checking the client data echoed back at
//! finish-time (ceremony type, challenge, origin). Signature and attestation
//! cryptography is the authenticator verifier's concern and stays behind this
//! trait, so the firewall core can be exercised against a deterministic
//! implementation.

use crate::firewall::error::GateError;
use crate::session::CeremonySession;
use crate::webauthn::{AuthenticationExtensions, CredentialRecord, WebauthnUser};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};

const CHALLENGE_LEN: usize = 32;
const CEREMONY_TIMEOUT_MS: u64 = 60_000;

/// Two-phase ceremony protocol: each `begin` returns the JSON options payload
/// for `navigator.credentials` plus the session state the matching `finish`
/// consumes.
pub trait CeremonyEngine: Send + Sync {
    /// Mint creation options for enrolling `user`.
    fn begin_registration(
        &self,
        user: &WebauthnUser,
    ) -> Result<(Value, CeremonySession), GateError>;

    /// Check the attestation against the begun session and produce the
    /// credential record to persist.
    fn finish_registration(
        &self,
        session: &CeremonySession,
        attestation: &str,
    ) -> Result<CredentialRecord, GateError>;

    /// Mint request options for `user`, binding `extensions` into both the
    /// payload and the session.
    fn begin_authentication(
        &self,
        user: &WebauthnUser,
        extensions: Option<AuthenticationExtensions>,
    ) -> Result<(Value, CeremonySession), GateError>;

    /// Check the assertion against the begun session and return the
    /// client-reported extension outputs (empty map when absent).
    fn finish_authentication(
        &self,
        session: &CeremonySession,
        assertion: &str,
    ) -> Result<AuthenticationExtensions, GateError>;
}

/// Challenge/response engine for a single relying party.
///
/// Validates the structural half of a ceremony: random challenge, client data
/// type, challenge echo, and origin. The authenticator signature itself is
/// the external verifier's job.
pub struct ChallengeEngine {
    rp_id: String,
    rp_name: String,
    rp_origin: String,
}

impl ChallengeEngine {
    #[must_use]
    pub fn new(
        rp_id: impl Into<String>,
        rp_name: impl Into<String>,
        rp_origin: impl Into<String>,
    ) -> Self {
        Self {
            rp_id: rp_id.into(),
            rp_name: rp_name.into(),
            rp_origin: rp_origin.into(),
        }
    }

    fn fresh_challenge() -> String {
        let mut challenge = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);
        Base64UrlUnpadded::encode_string(&challenge)
    }

    // Decode response.clientDataJSON and check the fields every ceremony
    // shares. `expected_type` is "webauthn.create" or "webauthn.get".
    fn verify_client_data(
        &self,
        session: &CeremonySession,
        credential: &Value,
        expected_type: &str,
    ) -> Result<(), GateError> {
        let encoded = credential
            .pointer("/response/clientDataJSON")
            .and_then(Value::as_str)
            .ok_or_else(|| GateError::input("credential is missing clientDataJSON"))?;

        let raw = Base64UrlUnpadded::decode_vec(encoded.trim_end_matches('='))
            .map_err(|_| GateError::input("clientDataJSON is not base64url"))?;
        let client_data: Value = serde_json::from_slice(&raw)
            .map_err(|_| GateError::input("clientDataJSON is not valid JSON"))?;

        let ceremony_type = client_data.get("type").and_then(Value::as_str);
        if ceremony_type != Some(expected_type) {
            return Err(GateError::verification(format!(
                "unexpected ceremony type: {}",
                ceremony_type.unwrap_or("absent")
            )));
        }

        let challenge = client_data.get("challenge").and_then(Value::as_str);
        if challenge != Some(session.challenge.as_str()) {
            return Err(GateError::verification("challenge mismatch"));
        }

        let origin = client_data.get("origin").and_then(Value::as_str);
        if origin != Some(self.rp_origin.as_str()) {
            return Err(GateError::verification(format!(
                "origin mismatch: {}",
                origin.unwrap_or("absent")
            )));
        }

        Ok(())
    }
}

impl CeremonyEngine for ChallengeEngine {
    fn begin_registration(
        &self,
        user: &WebauthnUser,
    ) -> Result<(Value, CeremonySession), GateError> {
        let challenge = Self::fresh_challenge();

        let options = json!({
            "publicKey": {
                "rp": { "id": self.rp_id, "name": self.rp_name },
                "user": {
                    "id": Base64UrlUnpadded::encode_string(&user.id.to_be_bytes()),
                    "name": user.name,
                    "displayName": user.name,
                },
                "challenge": challenge,
                "pubKeyCredParams": [
                    { "type": "public-key", "alg": -7 },
                    { "type": "public-key", "alg": -257 },
                ],
                "timeout": CEREMONY_TIMEOUT_MS,
                "attestation": "direct",
            }
        });

        let session = CeremonySession::new(user.id, user.name.clone(), challenge, None);
        Ok((options, session))
    }

    fn finish_registration(
        &self,
        session: &CeremonySession,
        attestation: &str,
    ) -> Result<CredentialRecord, GateError> {
        let credential: Value = serde_json::from_str(attestation)
            .map_err(|_| GateError::input("attestation is not valid JSON"))?;

        self.verify_client_data(session, &credential, "webauthn.create")?;

        let credential_id = credential
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GateError::input("attestation is missing a credential id"))?;

        Ok(CredentialRecord {
            credential_id: credential_id.to_string(),
            blob: attestation.as_bytes().to_vec(),
        })
    }

    fn begin_authentication(
        &self,
        user: &WebauthnUser,
        extensions: Option<AuthenticationExtensions>,
    ) -> Result<(Value, CeremonySession), GateError> {
        let credential = user
            .credential
            .as_ref()
            .ok_or_else(|| GateError::ceremony(format!("no credential on record for {}", user.name)))?;

        let challenge = Self::fresh_challenge();

        let mut public_key = json!({
            "challenge": challenge,
            "rpId": self.rp_id,
            "timeout": CEREMONY_TIMEOUT_MS,
            "allowCredentials": [
                { "type": "public-key", "id": credential.credential_id },
            ],
            "userVerification": "preferred",
        });
        if let Some(extensions) = &extensions {
            public_key["extensions"] = json!(extensions);
        }

        let session = CeremonySession::new(user.id, user.name.clone(), challenge, extensions);
        Ok((json!({ "publicKey": public_key }), session))
    }

    fn finish_authentication(
        &self,
        session: &CeremonySession,
        assertion: &str,
    ) -> Result<AuthenticationExtensions, GateError> {
        let credential: Value = serde_json::from_str(assertion)
            .map_err(|_| GateError::input("assertion is not valid JSON"))?;

        self.verify_client_data(session, &credential, "webauthn.get")?;

        // Absent extension outputs are an empty map, not an error: the
        // comparison against the session decides whether that is acceptable.
        let mut outputs = AuthenticationExtensions::new();
        if let Some(results) = credential
            .get("clientExtensionResults")
            .and_then(Value::as_object)
        {
            for (key, value) in results {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                outputs.insert(key.clone(), rendered);
            }
        }
        Ok(outputs)
    }
}
