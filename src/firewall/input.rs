//! Typed accessors over a buffered request, with sticky error capture.
//!
//! Transaction templates read several inputs in a row to format a
//! confirmation string; threading a `Result` through every step would bury
//! the formatting under plumbing. Instead the infallible getters return a
//! default on failure and record the first error, and the gate surfaces it
//! via [`RequestReader::take_err`] before any ceremony verification runs.
//! Once an accessor has failed, every later call on the same reader
//! short-circuits: it returns the stored error (or a default) without doing
//! any work, so a context lookup never reaches the backend after a bad read.

use crate::firewall::error::GateError;
use crate::firewall::request::BufferedRequest;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use url::form_urlencoded;

/// Which body format the bare `get` accessor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultInput {
    Form,
    Json,
}

pub type ContextFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;

/// A named deployment-specific lookup, e.g. resolving an SSH key id to its
/// display name via a backend query. Receives the argument list the
/// transaction template extracted from the request.
pub type ContextGetter = Arc<dyn Fn(Vec<String>) -> ContextFuture + Send + Sync>;

pub type ContextGetters = HashMap<&'static str, ContextGetter>;

pub struct RequestReader {
    request: Arc<BufferedRequest>,
    path_vars: HashMap<String, String>,
    context: Arc<ContextGetters>,
    default_input: DefaultInput,
    form: HashMap<String, String>,
    json: Option<Result<Value, String>>,
    err: Option<GateError>,
}

impl RequestReader {
    #[must_use]
    pub fn new(
        request: Arc<BufferedRequest>,
        path_vars: HashMap<String, String>,
        context: Arc<ContextGetters>,
        default_input: DefaultInput,
    ) -> Self {
        // Query pairs first, body pairs override on collision.
        let mut form: HashMap<String, String> = HashMap::new();
        if let Some(query) = request.uri.query() {
            for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                form.insert(key.into_owned(), value.into_owned());
            }
        }
        for (key, value) in form_urlencoded::parse(&request.body()) {
            form.insert(key.into_owned(), value.into_owned());
        }

        Self {
            request,
            path_vars,
            context,
            default_input,
            form,
            json: None,
            err: None,
        }
    }

    #[must_use]
    pub fn request(&self) -> &Arc<BufferedRequest> {
        &self.request
    }

    /// The first error any infallible accessor hit, if any. Clears it.
    pub fn take_err(&mut self) -> Result<(), GateError> {
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, err: GateError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    // The stored error, when a prior accessor already failed.
    fn short_circuit(&self) -> Result<(), GateError> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    // Default-input accessor: form or JSON body depending on route
    // configuration.
    pub fn get(&mut self, name: &str) -> String {
        match self.default_input {
            DefaultInput::Form => self.form_input(name),
            DefaultInput::Json => self.json_input(&[name]),
        }
    }

    pub fn get_i64(&mut self, name: &str) -> i64 {
        match self.default_input {
            DefaultInput::Form => self.form_input_i64(name),
            DefaultInput::Json => self.json_input_i64(&[name]),
        }
    }

    /// # Errors
    /// Returns the stored error when a prior accessor failed, an input error
    /// when the field is absent.
    pub fn form_input_with_err(&self, name: &str) -> Result<String, GateError> {
        self.short_circuit()?;
        self.form
            .get(name)
            .cloned()
            .ok_or_else(|| GateError::input(format!("missing form field: {name}")))
    }

    pub fn form_input(&mut self, name: &str) -> String {
        match self.form_input_with_err(name) {
            Ok(value) => value,
            Err(err) => {
                self.record(err);
                String::new()
            }
        }
    }

    pub fn form_input_i64(&mut self, name: &str) -> i64 {
        match self.form_input_with_err(name).and_then(|raw| parse_i64(name, &raw)) {
            Ok(value) => value,
            Err(err) => {
                self.record(err);
                0
            }
        }
    }

    /// # Errors
    /// Returns the stored error when a prior accessor failed, an input error
    /// when the route variable is absent.
    pub fn path_var_with_err(&self, name: &str) -> Result<String, GateError> {
        self.short_circuit()?;
        self.path_vars
            .get(name)
            .cloned()
            .ok_or_else(|| GateError::input(format!("missing route variable: {name}")))
    }

    pub fn path_var(&mut self, name: &str) -> String {
        match self.path_var_with_err(name) {
            Ok(value) => value,
            Err(err) => {
                self.record(err);
                String::new()
            }
        }
    }

    pub fn path_var_i64(&mut self, name: &str) -> i64 {
        match self.path_var_with_err(name).and_then(|raw| parse_i64(name, &raw)) {
            Ok(value) => value,
            Err(err) => {
                self.record(err);
                0
            }
        }
    }

    /// Walk `keys` into the JSON body and render the leaf as text. Numeric
    /// leaves keep their exact source representation.
    ///
    /// # Errors
    /// Returns the stored error when a prior accessor failed, an input error
    /// when the body is not JSON, the path is absent, or the leaf is not
    /// scalar.
    pub fn json_input_with_err(&mut self, keys: &[&str]) -> Result<String, GateError> {
        self.short_circuit()?;
        let body = self.parsed_json()?;
        let mut node = body;
        for key in keys {
            node = node.get(key).ok_or_else(|| {
                GateError::input(format!("missing JSON field: {}", keys.join(".")))
            })?;
        }
        match node {
            Value::String(text) => Ok(text.clone()),
            Value::Number(number) => Ok(number.to_string()),
            Value::Bool(flag) => Ok(flag.to_string()),
            _ => Err(GateError::input(format!(
                "JSON field is not scalar: {}",
                keys.join(".")
            ))),
        }
    }

    pub fn json_input(&mut self, keys: &[&str]) -> String {
        match self.json_input_with_err(keys) {
            Ok(value) => value,
            Err(err) => {
                self.record(err);
                String::new()
            }
        }
    }

    pub fn json_input_i64(&mut self, keys: &[&str]) -> i64 {
        let parsed = self
            .json_input_with_err(keys)
            .and_then(|raw| parse_i64(&keys.join("."), &raw));
        match parsed {
            Ok(value) => value,
            Err(err) => {
                self.record(err);
                0
            }
        }
    }

    /// Invoke the named deployment-specific lookup. A reader with a stored
    /// error never invokes the lookup at all.
    ///
    /// # Errors
    /// Returns the stored error when a prior accessor failed, an input error
    /// for an unknown name, a dependency error when the lookup itself fails.
    pub async fn get_context_with_err(
        &self,
        name: &str,
        args: Vec<String>,
    ) -> Result<String, GateError> {
        self.short_circuit()?;
        let getter = self
            .context
            .get(name)
            .cloned()
            .ok_or_else(|| GateError::input(format!("unknown context getter: {name}")))?;
        getter(args).await.map_err(GateError::dependency)
    }

    pub async fn get_context(&mut self, name: &str, args: Vec<String>) -> String {
        match self.get_context_with_err(name, args).await {
            Ok(value) => value,
            Err(err) => {
                self.record(err);
                String::new()
            }
        }
    }

    fn parsed_json(&mut self) -> Result<&Value, GateError> {
        if self.json.is_none() {
            let parsed = serde_json::from_slice::<Value>(&self.request.body())
                .map_err(|err| err.to_string());
            self.json = Some(parsed);
        }
        match self.json.as_ref() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(GateError::input(format!("body is not valid JSON: {err}"))),
            None => Err(GateError::input("body is not valid JSON")),
        }
    }
}

fn parse_i64(name: &str, raw: &str) -> Result<i64, GateError> {
    raw.parse::<i64>()
        .map_err(|_| GateError::input(format!("field is not an integer: {name}={raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request},
    };

    async fn buffered(uri: &str, content_type: &str, body: &'static str) -> Arc<BufferedRequest> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body))
            .expect("request");
        Arc::new(BufferedRequest::capture(request).await.expect("capture"))
    }

    fn reader(request: Arc<BufferedRequest>, default_input: DefaultInput) -> RequestReader {
        RequestReader::new(
            request,
            HashMap::from([("repo".to_string(), "demo".to_string())]),
            Arc::new(ContextGetters::new()),
            default_input,
        )
    }

    #[tokio::test]
    async fn test_form_fields() {
        let request = buffered(
            "/settings",
            "application/x-www-form-urlencoded",
            "username=alice&keyID=42",
        )
        .await;
        let mut reader = reader(request, DefaultInput::Form);

        assert_eq!(reader.get("username"), "alice");
        assert_eq!(reader.form_input_i64("keyID"), 42);
        assert_eq!(reader.path_var("repo"), "demo");
        assert!(reader.take_err().is_ok());
    }

    #[tokio::test]
    async fn test_missing_field_is_sticky() {
        let request = buffered(
            "/settings",
            "application/x-www-form-urlencoded",
            "username=alice",
        )
        .await;
        let mut reader = reader(request, DefaultInput::Form);

        assert_eq!(reader.form_input("absent"), "");
        // Once failed, later reads short-circuit to the default even when the
        // field is present.
        assert_eq!(reader.form_input("username"), "");
        assert!(matches!(
            reader.form_input_with_err("username"),
            Err(GateError::Input(_))
        ));
        let err = reader.take_err().expect_err("sticky error expected");
        assert!(err.to_string().contains("absent"));
        // take_err clears, reads work again.
        assert!(reader.take_err().is_ok());
        assert_eq!(reader.form_input("username"), "alice");
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let request = buffered("/settings", "application/x-www-form-urlencoded", "").await;
        let mut reader = reader(request, DefaultInput::Form);

        reader.form_input("first_missing");
        reader.form_input("second_missing");
        let err = reader.take_err().expect_err("sticky error expected");
        assert!(err.to_string().contains("first_missing"));
    }

    #[tokio::test]
    async fn test_json_path_and_precision() {
        // A numeric leaf wider than f64 must come back textually intact.
        let request = buffered(
            "/api/v1/keys",
            "application/json",
            r#"{"key": {"id": 9007199254740993, "title": "laptop"}}"#,
        )
        .await;
        let mut reader = reader(request, DefaultInput::Json);

        assert_eq!(reader.json_input(&["key", "title"]), "laptop");
        assert_eq!(reader.json_input(&["key", "id"]), "9007199254740993");
        assert_eq!(reader.json_input_i64(&["key", "id"]), 9_007_199_254_740_993);
        assert!(reader.take_err().is_ok());
    }

    #[tokio::test]
    async fn test_json_on_non_json_body() {
        let request = buffered(
            "/settings",
            "application/x-www-form-urlencoded",
            "username=alice",
        )
        .await;
        let mut reader = reader(request, DefaultInput::Json);

        assert_eq!(reader.get("username"), "");
        assert!(reader.take_err().is_err());
    }

    #[tokio::test]
    async fn test_query_and_body_merge() {
        let request = buffered(
            "/settings?source=query&both=query",
            "application/x-www-form-urlencoded",
            "both=body",
        )
        .await;
        let mut reader = reader(request, DefaultInput::Form);

        assert_eq!(reader.form_input("source"), "query");
        assert_eq!(reader.form_input("both"), "body");
    }

    #[tokio::test]
    async fn test_context_getter() {
        let request = buffered("/x", "application/x-www-form-urlencoded", "").await;
        let mut getters = ContextGetters::new();
        getters.insert(
            "ssh_key_name",
            Arc::new(|args: Vec<String>| {
                Box::pin(async move { Ok(format!("key-{}", args.join(","))) }) as ContextFuture
            }),
        );
        let mut reader = RequestReader::new(
            request,
            HashMap::new(),
            Arc::new(getters),
            DefaultInput::Form,
        );

        assert_eq!(
            reader.get_context("ssh_key_name", vec!["42".to_string()]).await,
            "key-42"
        );
        reader.get_context("unknown", Vec::new()).await;
        assert!(reader.take_err().is_err());
    }

    #[tokio::test]
    async fn test_failed_reader_never_invokes_context_lookup() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let request = buffered("/x", "application/x-www-form-urlencoded", "").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut getters = ContextGetters::new();
        getters.insert(
            "ssh_key_name",
            Arc::new(move |_args: Vec<String>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok("laptop".to_string()) }) as ContextFuture
            }),
        );
        let mut reader = RequestReader::new(
            request,
            HashMap::new(),
            Arc::new(getters),
            DefaultInput::Form,
        );

        assert_eq!(reader.form_input("id"), "");
        assert_eq!(
            reader.get_context("ssh_key_name", vec!["42".to_string()]).await,
            ""
        );
        // The lookup must not run while the reader carries an error.
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let err = reader.take_err().expect_err("sticky error expected");
        assert!(err.to_string().contains("id"));
        assert_eq!(
            reader.get_context("ssh_key_name", vec!["42".to_string()]).await,
            "laptop"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_reader_short_circuits_every_accessor() {
        let request = buffered(
            "/settings?keyID=42",
            "application/x-www-form-urlencoded",
            "username=alice",
        )
        .await;
        let mut reader = reader(request, DefaultInput::Form);

        reader.form_input("absent");
        assert_eq!(reader.form_input_i64("keyID"), 0);
        assert_eq!(reader.path_var("repo"), "");
        assert_eq!(reader.json_input(&["key"]), "");
        assert!(matches!(
            reader.path_var_with_err("repo"),
            Err(GateError::Input(_))
        ));

        let err = reader.take_err().expect_err("sticky error expected");
        assert!(err.to_string().contains("absent"));
    }
}
