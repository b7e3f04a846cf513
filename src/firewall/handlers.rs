//! HTTP surface: the ceremony endpoints, the gate runner for secured routes,
//! and the passthrough fallback.
//!
//! Every response the firewall originates carries the CORS pair for the
//! configured frontend origin, and every endpoint that consumes a ceremony
//! session attaches the removal cookie whether verification succeeded or
//! not.

use crate::firewall::error::GateError;
use crate::firewall::input::RequestReader;
use crate::firewall::request::BufferedRequest;
use crate::firewall::routes::{Effect, GateSpec, PrincipalSource, RouteKind, SecuredRoute};
use crate::firewall::FirewallState;
use crate::session::{CeremonyKind, SessionStore};
use crate::webauthn::{tx_auth_simple, UserQuery};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, SET_COOKIE,
        },
        HeaderValue, Request, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

// Attach the frontend CORS pair unless the response (e.g. a proxied one)
// already carries it.
fn finish(state: &FirewallState, mut response: Response) -> Response {
    let headers = response.headers_mut();
    if !headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, state.frontend_origin.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    response
}

fn fail(state: &FirewallState, err: GateError) -> Response {
    warn!(status = %err.status(), %err, "request refused");
    finish(state, err.into_response())
}

fn reader_for(state: &FirewallState, request: &Arc<BufferedRequest>) -> RequestReader {
    RequestReader::new(
        Arc::clone(request),
        HashMap::new(),
        Arc::clone(&state.context),
        state.default_input,
    )
}

fn with_removal(kind: CeremonyKind, mut response: Response) -> Response {
    response
        .headers_mut()
        .append(SET_COOKIE, SessionStore::removal_cookie(kind));
    response
}

/// `OPTIONS` answer for the ceremony endpoints.
pub async fn preflight(State(state): State<Arc<FirewallState>>) -> Response {
    let response = (
        StatusCode::OK,
        [
            (ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
            (ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization"),
        ],
    )
        .into_response();
    finish(&state, response)
}

/// `GET {prefix}/is_enabled/{user}`
pub async fn is_enabled(
    State(state): State<Arc<FirewallState>>,
    Path(user): Path<String>,
) -> Response {
    match state.step_up.is_enabled(&UserQuery::ByName(user)).await {
        Ok(enabled) => finish(
            &state,
            Json(json!({ "webauthn_is_enabled": enabled })).into_response(),
        ),
        Err(err) => fail(&state, err),
    }
}

/// `POST {prefix}/begin_register`
///
/// The form names the account being enrolled; the browser session decides
/// who is asking. The two must agree, otherwise any caller could enroll a
/// credential for somebody else's account.
pub async fn begin_register(
    State(state): State<Arc<FirewallState>>,
    request: Request<Body>,
) -> Response {
    let buffered = match BufferedRequest::capture(request).await {
        Ok(buffered) => Arc::new(buffered),
        Err(err) => return fail(&state, err),
    };

    let principal = match state.principal.resolve(&buffered.headers).await {
        Ok(uid) => uid,
        Err(err) => return fail(&state, err),
    };

    let mut reader = reader_for(&state, &buffered);
    let username = reader.get("username");
    let user_id = reader.get_i64("userID");
    if let Err(err) = reader.take_err() {
        return fail(&state, err);
    }
    if user_id != principal {
        return fail(
            &state,
            GateError::input("userID does not match the authenticated session"),
        );
    }

    let (options, session) = match state.step_up.begin_registration(user_id, &username) {
        Ok(begun) => begun,
        Err(err) => return fail(&state, err),
    };
    let cookie = match state.sessions.save(CeremonyKind::Registration, &session) {
        Ok(cookie) => cookie,
        Err(err) => return fail(&state, GateError::dependency(err)),
    };

    let mut response = finish(&state, Json(options).into_response());
    response.headers_mut().append(SET_COOKIE, cookie);
    response
}

/// `POST {prefix}/finish_register`
pub async fn finish_register(
    State(state): State<Arc<FirewallState>>,
    request: Request<Body>,
) -> Response {
    let buffered = match BufferedRequest::capture(request).await {
        Ok(buffered) => Arc::new(buffered),
        Err(err) => return fail(&state, err),
    };

    let session = match state
        .sessions
        .take(CeremonyKind::Registration, &buffered.headers)
    {
        Ok(session) => session,
        Err(err) => return with_removal(CeremonyKind::Registration, fail(&state, err)),
    };

    let mut reader = reader_for(&state, &buffered);
    let username = reader.get("username");
    let user_id = reader.get_i64("userID");
    let credentials = reader.get("credentials");
    // The form must name the same account the ceremony was begun for.
    let result = match reader.take_err() {
        Ok(()) if user_id != session.user_id || username != session.username => Err(
            GateError::ceremony("registration session was begun for a different account"),
        ),
        Ok(()) => state.step_up.finish_registration(&session, &credentials).await,
        Err(err) => Err(err),
    };

    let response = match result {
        // An empty `redirectTo` tells the frontend to reload in place.
        Ok(()) => finish(&state, Json(json!({ "redirectTo": "" })).into_response()),
        Err(err) => fail(&state, err),
    };
    with_removal(CeremonyKind::Registration, response)
}

/// `POST {prefix}/begin_login`
///
/// Fail-open: an account with no credential on record gets an empty payload
/// and no ceremony.
pub async fn begin_login(
    State(state): State<Arc<FirewallState>>,
    request: Request<Body>,
) -> Response {
    let buffered = match BufferedRequest::capture(request).await {
        Ok(buffered) => Arc::new(buffered),
        Err(err) => return fail(&state, err),
    };

    let mut reader = reader_for(&state, &buffered);
    let user_name = reader.get("user_name");
    if let Err(err) = reader.take_err() {
        return fail(&state, err);
    }

    begin_ceremony(&state, &UserQuery::ByName(user_name), None).await
}

/// `POST {prefix}/begin_attestation`
///
/// Binds the client-proposed confirmation text into the ceremony; the
/// secured route recomputes and enforces the text at finish-time.
pub async fn begin_attestation(
    State(state): State<Arc<FirewallState>>,
    request: Request<Body>,
) -> Response {
    let buffered = match BufferedRequest::capture(request).await {
        Ok(buffered) => Arc::new(buffered),
        Err(err) => return fail(&state, err),
    };

    let user_id = match state.principal.resolve(&buffered.headers).await {
        Ok(uid) => uid,
        Err(err) => return fail(&state, err),
    };

    let mut reader = reader_for(&state, &buffered);
    let auth_text = reader.get("auth_text");
    if let Err(err) = reader.take_err() {
        return fail(&state, err);
    }

    begin_ceremony(
        &state,
        &UserQuery::ById(user_id),
        Some(tx_auth_simple(auth_text)),
    )
    .await
}

async fn begin_ceremony(
    state: &FirewallState,
    query: &UserQuery,
    extensions: Option<crate::webauthn::AuthenticationExtensions>,
) -> Response {
    match state.step_up.begin_authentication(query, extensions).await {
        Ok(None) => finish(state, Json(json!({})).into_response()),
        Ok(Some((options, session))) => {
            let cookie = match state.sessions.save(CeremonyKind::Authentication, &session) {
                Ok(cookie) => cookie,
                Err(err) => return fail(state, GateError::dependency(err)),
            };
            let mut response = finish(state, Json(options).into_response());
            response.headers_mut().append(SET_COOKIE, cookie);
            response
        }
        Err(err) => fail(state, err),
    }
}

/// `POST {prefix}/disable`
///
/// Dropping the protection is itself a gated action, bound to a
/// `Confirm disable webauthn for {name}` confirmation. Idempotent: an
/// account that is not enabled has nothing to confirm with and passes.
pub async fn disable(
    State(state): State<Arc<FirewallState>>,
    request: Request<Body>,
) -> Response {
    let buffered = match BufferedRequest::capture(request).await {
        Ok(buffered) => Arc::new(buffered),
        Err(err) => return fail(&state, err),
    };

    let user_id = match state.principal.resolve(&buffered.headers).await {
        Ok(uid) => uid,
        Err(err) => return fail(&state, err),
    };
    let query = UserQuery::ById(user_id);

    let redirect = || Json(json!({ "redirectTo": "" })).into_response();

    match state.step_up.is_enabled(&query).await {
        Ok(true) => {}
        Ok(false) => return finish(&state, redirect()),
        Err(err) => return fail(&state, err),
    }

    let user = match state.step_up.get_user(&query).await {
        Ok(user) => user,
        Err(err) => return fail(&state, err),
    };

    let mut reader = reader_for(&state, &buffered);
    let assertion = reader.get("assertion");
    if let Err(err) = reader.take_err() {
        return fail(&state, err);
    }

    let session = match state
        .sessions
        .take(CeremonyKind::Authentication, &buffered.headers)
    {
        Ok(session) => session,
        Err(err) => return with_removal(CeremonyKind::Authentication, fail(&state, err)),
    };

    let expected = tx_auth_simple(format!("Confirm disable webauthn for {}", user.name));
    let result = match state
        .step_up
        .verify_assertion(&user, &session, Some(&expected), &assertion)
    {
        Ok(()) => state.step_up.disable(&user.name).await,
        Err(err) => Err(err),
    };

    let response = match result {
        Ok(()) => finish(&state, redirect()),
        Err(err) => fail(&state, err),
    };
    with_removal(CeremonyKind::Authentication, response)
}

/// Fallback: anything not matched above is plainly proxied.
pub async fn passthrough(
    State(state): State<Arc<FirewallState>>,
    request: Request<Body>,
) -> Response {
    let buffered = match BufferedRequest::capture(request).await {
        Ok(buffered) => buffered,
        Err(err) => return fail(&state, err),
    };
    match state.proxy.forward(&buffered).await {
        Ok(response) => response,
        Err(err) => fail(&state, err),
    }
}

/// Entry point for a registered secured route.
pub async fn run_secured(
    state: Arc<FirewallState>,
    route: Arc<SecuredRoute>,
    path_vars: HashMap<String, String>,
    request: Request<Body>,
) -> Response {
    let buffered = match BufferedRequest::capture(request).await {
        Ok(buffered) => Arc::new(buffered),
        Err(err) => return fail(&state, err),
    };

    match &route.kind {
        RouteKind::Gate(spec) => run_gate(&state, spec, &buffered, path_vars).await,
        RouteKind::DispatchOnField { field, arms } => {
            let mut reader = RequestReader::new(
                Arc::clone(&buffered),
                path_vars.clone(),
                Arc::clone(&state.context),
                state.default_input,
            );
            // An absent or unmatched selector means no arm applies and the
            // request passes through ungated.
            let selector = reader.get(*field);
            match arms.get(selector.as_str()) {
                Some(spec) => {
                    debug!(path = %route.path, %selector, "dispatching to gated arm");
                    run_gate(&state, spec, &buffered, path_vars).await
                }
                None => match state.proxy.forward(&buffered).await {
                    Ok(response) => response,
                    Err(err) => fail(&state, err),
                },
            }
        }
    }
}

async fn run_gate(
    state: &Arc<FirewallState>,
    spec: &GateSpec,
    request: &Arc<BufferedRequest>,
    path_vars: HashMap<String, String>,
) -> Response {
    let mut reader = RequestReader::new(
        Arc::clone(request),
        path_vars,
        Arc::clone(&state.context),
        state.default_input,
    );

    let query = match &spec.principal {
        PrincipalSource::BrowserSession => {
            match state.principal.resolve(&request.headers).await {
                Ok(uid) => UserQuery::ById(uid),
                Err(err) => return fail(state, err),
            }
        }
        PrincipalSource::Field(name) => {
            let username = reader.get(name);
            if let Err(err) = reader.take_err() {
                return fail(state, err);
            }
            UserQuery::ByName(username)
        }
    };

    match state.step_up.is_enabled(&query).await {
        // Fail-open: no credential on record means no ceremony is required.
        Ok(false) => {
            debug!(?query, "account not enabled, forwarding ungated");
            return match run_effect(state, spec, request).await {
                Ok(response) => response,
                Err(err) => fail(state, err),
            };
        }
        Ok(true) => {}
        Err(err) => return fail(state, err),
    }

    let user = match state.step_up.get_user(&query).await {
        Ok(user) => user,
        Err(err) => return fail(state, err),
    };

    let expected = match &spec.template {
        Some(template) => match template(&user, &mut reader).await {
            Ok(extensions) => Some(extensions),
            Err(err) => return fail(state, err),
        },
        None => None,
    };

    let assertion = reader.get("assertion");
    if let Err(err) = reader.take_err() {
        return fail(state, err);
    }

    let session = match state
        .sessions
        .take(CeremonyKind::Authentication, &request.headers)
    {
        Ok(session) => session,
        Err(err) => return with_removal(CeremonyKind::Authentication, fail(state, err)),
    };

    let result = match state
        .step_up
        .verify_assertion(&user, &session, expected.as_ref(), &assertion)
    {
        Ok(()) => run_effect(state, spec, request).await,
        Err(err) => Err(err),
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => fail(state, err),
    };
    with_removal(CeremonyKind::Authentication, response)
}

async fn run_effect(
    state: &Arc<FirewallState>,
    spec: &GateSpec,
    request: &Arc<BufferedRequest>,
) -> Result<Response, GateError> {
    match &spec.effect {
        Effect::Forward => state.proxy.forward(request).await,
        Effect::Custom(effect) => effect(Arc::clone(state), Arc::clone(request)).await,
    }
}
