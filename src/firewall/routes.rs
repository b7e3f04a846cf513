//! The secured-route table.
//!
//! A deployment declares which method/path pairs are gated, how the caller
//! is identified, and how the transaction confirmation string is recomputed
//! from the request being authorized. Everything else falls through to the
//! plain reverse proxy.

use crate::firewall::error::GateError;
use crate::firewall::input::RequestReader;
use crate::firewall::request::BufferedRequest;
use crate::firewall::FirewallState;
use crate::webauthn::{AuthenticationExtensions, WebauthnUser};
use axum::{body::Body, http::Method, response::Response};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// How a gated route identifies the account the ceremony must belong to.
#[derive(Debug, Clone)]
pub enum PrincipalSource {
    /// Ask the backend who owns the caller's browser session (bearer hint as
    /// fallback).
    BrowserSession,
    /// Read the account name out of the named request field. Used for the
    /// login gate, where no browser session exists yet.
    Field(&'static str),
}

pub type TxFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AuthenticationExtensions, GateError>> + Send + 'a>>;

/// Recomputes the extension map a request must have been authorized with.
/// Runs at finish-time against the actual request, so a ceremony begun for
/// one action can never authorize another.
pub type TxTemplate =
    Arc<dyn for<'a> Fn(&'a WebauthnUser, &'a mut RequestReader) -> TxFuture<'a> + Send + Sync>;

pub type EffectFuture = Pin<Box<dyn Future<Output = Result<Response<Body>, GateError>> + Send>>;

/// What happens after the gate admits a request.
pub type EffectFn =
    Arc<dyn Fn(Arc<FirewallState>, Arc<BufferedRequest>) -> EffectFuture + Send + Sync>;

#[derive(Clone)]
pub enum Effect {
    /// Replay the buffered request to the backend.
    Forward,
    /// Run a deployment-provided handler instead of forwarding.
    Custom(EffectFn),
}

/// One gated flow: identify the principal, recompute the expected
/// transaction extension, verify, then apply the effect.
#[derive(Clone)]
pub struct GateSpec {
    pub principal: PrincipalSource,
    pub template: Option<TxTemplate>,
    pub effect: Effect,
}

impl GateSpec {
    #[must_use]
    pub fn new(principal: PrincipalSource, template: Option<TxTemplate>) -> Self {
        Self {
            principal,
            template,
            effect: Effect::Forward,
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: EffectFn) -> Self {
        self.effect = Effect::Custom(effect);
        self
    }
}

#[derive(Clone)]
pub enum RouteKind {
    /// The whole route is gated.
    Gate(GateSpec),
    /// Multiplexed endpoint: the named field selects an arm; unmatched
    /// values pass through ungated.
    DispatchOnField {
        field: &'static str,
        arms: HashMap<&'static str, GateSpec>,
    },
}

#[derive(Clone)]
pub struct SecuredRoute {
    pub method: Method,
    pub path: String,
    pub kind: RouteKind,
}

impl SecuredRoute {
    /// A fully gated route that forwards on success.
    #[must_use]
    pub fn gated(
        method: Method,
        path: impl Into<String>,
        principal: PrincipalSource,
        template: Option<TxTemplate>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            kind: RouteKind::Gate(GateSpec::new(principal, template)),
        }
    }

    /// A gated route with a deployment-provided effect.
    #[must_use]
    pub fn gated_with_effect(
        method: Method,
        path: impl Into<String>,
        principal: PrincipalSource,
        template: Option<TxTemplate>,
        effect: EffectFn,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            kind: RouteKind::Gate(GateSpec::new(principal, template).with_effect(effect)),
        }
    }

    /// A multiplexed route: gate only the arms named in `arms`, keyed on the
    /// value of `field`.
    #[must_use]
    pub fn dispatch_on(
        method: Method,
        path: impl Into<String>,
        field: &'static str,
        arms: Vec<(&'static str, GateSpec)>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            kind: RouteKind::DispatchOnField {
                field,
                arms: arms.into_iter().collect(),
            },
        }
    }
}

/// Wrap an async closure producing a confirmation string into a template.
pub fn tx_template<F>(f: F) -> TxTemplate
where
    F: for<'a> Fn(&'a WebauthnUser, &'a mut RequestReader) -> Pin<Box<dyn Future<Output = Result<String, GateError>> + Send + 'a>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(move |user, reader| {
        let fut = f(user, reader);
        Box::pin(async move { Ok(crate::webauthn::tx_auth_simple(fut.await?)) })
    })
}
