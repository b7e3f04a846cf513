//! # WebAuthn Firewall
//!
//! An authentication-aware reverse proxy that sits between a browser and an
//! application backend. Ordinary traffic is forwarded untouched; for a
//! configurable set of sensitive routes the caller must first complete a
//! WebAuthn challenge/response ceremony, and the ceremony is bound to the
//! exact action being performed via a transaction extension (e.g.
//! `Confirm repository delete: alice/demo`), so a captured assertion cannot
//! be replayed against a different action.
//!
//! ## Architecture
//!
//! - [`firewall`] — the request-interception framework: route table, secured
//!   handlers, buffered request bodies, and the reverse-proxy dispatcher.
//! - [`webauthn`] — the two-phase begin/finish ceremony protocol, the
//!   ceremony-engine seam, and the credential-record store.
//! - [`session`] — one-shot encrypted cookie storage for in-flight ceremony
//!   state.
//! - [`cli`] — clap command line, telemetry bootstrap, and the server action.
//!
//! The cryptographic verification of attestations and assertions is an
//! external collaborator behind [`webauthn::engine::CeremonyEngine`]; this
//! crate owns the protocol orchestration around it: when a ceremony is
//! required, what must match, and what is forwarded.

pub mod cli;
pub mod firewall;
pub mod session;
pub mod tls;
pub mod webauthn;

/// User agent for outbound HTTP calls (backend whoami, context lookups).
pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
