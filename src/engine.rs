//! Rule dispatch and response rendering.
//!
//! For each request the engine resolves the project's matching rule, picks
//! the response (or the first conditional response whose condition holds),
//! renders every templated field, compresses the body when asked to, and
//! holds the response back until the configured latency has elapsed since
//! the request arrived.

use crate::config::DispatchSettings;
use crate::latency::{remaining_delay, Latency};
use crate::matcher::{parse_cookie_header, parse_query_string, resolve};
use crate::model::{
    ConditionalResponse, ConditionalResponseValue, CookieSpec, LatencyValue, ResponseTemplate,
    RuleAction, StatusSpec,
};
use crate::store::{Store, StoreError};
use crate::template::{RequestContext, TemplateRegistry};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Status used when a templated status cannot be rendered.
const FALLBACK_STATUS: u16 = 200;

/// An incoming request as seen by the engine.
#[derive(Debug, Clone, Default)]
pub struct MockRequest {
    pub method: String,
    /// Path within the project, starting with `/`
    pub path: String,
    /// Raw query string, without the `?`
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    fn context(&self, params: HashMap<String, String>) -> RequestContext {
        let headers: HashMap<String, String> = self
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        let cookies = headers
            .get("cookie")
            .map(|header| parse_cookie_header(header))
            .unwrap_or_default();

        RequestContext {
            method: self.method.clone(),
            path: self.path.clone(),
            params,
            query: parse_query_string(self.query.as_deref().unwrap_or("")),
            headers,
            cookies,
            body: None,
            json: None,
        }
        .with_body(&self.body)
    }
}

/// A fully rendered response, ready for the transport to write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MockResponse {
    /// Set before anything else; `None` leaves content type to the transport
    pub content_type: Option<String>,
    pub status: u16,
    /// Headers in declaration order
    pub headers: Vec<(String, String)>,
    /// `Set-Cookie` values in declaration order
    pub cookies: Vec<String>,
    pub body: Option<Vec<u8>>,
}

impl MockResponse {
    /// First header with the given name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no rule matches {method} {path}")]
    NoMatchingRule { method: String, path: String },

    #[error("no conditional response of rule '{rule}' matched")]
    NoConditionMatched { rule: String },

    #[error("rule '{rule}' has no usable response")]
    InvalidRule { rule: String },
}

impl DispatchError {
    /// Whether the request should be answered as not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            DispatchError::Store(e) => e.is_not_found(),
            DispatchError::NoMatchingRule { .. } | DispatchError::NoConditionMatched { .. } => true,
            DispatchError::InvalidRule { .. } => false,
        }
    }
}

/// Mock dispatch engine
///
/// Serves rule responses from the project store.
pub struct MockEngine {
    store: Arc<Store>,
    templates: TemplateRegistry,
    settings: DispatchSettings,
    /// Total requests processed.
    requests_total: AtomicU64,
    /// Total requests answered by a rule.
    requests_matched: AtomicU64,
    /// Total requests no rule answered.
    requests_unmatched: AtomicU64,
}

impl MockEngine {
    pub fn new(store: Arc<Store>, templates: TemplateRegistry, settings: DispatchSettings) -> Self {
        Self {
            store,
            templates,
            settings,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Get total requests processed.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get total requests matched.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    /// Get total requests unmatched.
    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Answer `request` with the matching rule of `project`.
    ///
    /// Returns once the rule's latency has elapsed since `arrival`, so the
    /// time spent rendering counts towards the simulated delay.
    pub async fn dispatch(
        &self,
        project: &str,
        request: &MockRequest,
        arrival: Instant,
    ) -> Result<MockResponse, DispatchError> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let result = self.respond(project, request).await;
        match &result {
            Ok((rule, _, _)) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_matches {
                    info!(
                        project,
                        rule = %rule,
                        method = %request.method,
                        path = %request.path,
                        "Request matched rule"
                    );
                }
            }
            Err(e) => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    warn!(
                        project,
                        method = %request.method,
                        path = %request.path,
                        reason = %e,
                        "No response for request"
                    );
                }
            }
        }
        let (rule, response, delay) = result?;

        let remaining = remaining_delay(delay, arrival.elapsed());
        if !remaining.is_zero() {
            debug!(rule = %rule, delay_ms = delay.as_millis() as u64, remaining_ms = remaining.as_millis() as u64, "Holding response");
            tokio::time::sleep(remaining).await;
        }

        Ok(response)
    }

    /// Resolve, render and encode. Returns the rule name, the response and
    /// the intended total delay.
    async fn respond(
        &self,
        project: &str,
        request: &MockRequest,
    ) -> Result<(String, MockResponse, Duration), DispatchError> {
        let project = self.store.get_project(project).await?;
        let route = resolve(&project.rules, &request.method, &request.path).ok_or_else(|| {
            DispatchError::NoMatchingRule {
                method: request.method.clone(),
                path: request.path.clone(),
            }
        })?;
        let rule = route.rule;
        let ctx = request.context(route.params);

        let (engine, template) = match rule.action() {
            Some(RuleAction::Respond(response)) => {
                (response.templating_engine.as_str(), &response.template)
            }
            Some(RuleAction::Conditional(conditional)) => {
                let value = self
                    .select_conditional(conditional, &ctx)
                    .await
                    .ok_or_else(|| DispatchError::NoConditionMatched {
                        rule: rule.name.clone(),
                    })?;
                (conditional.templating_engine.as_str(), &value.template)
            }
            None => {
                return Err(DispatchError::InvalidRule {
                    rule: rule.name.clone(),
                })
            }
        };

        let mut response = self.render_response(engine, template, &ctx).await;
        let delay = self.compute_latency(engine, template, &ctx).await;
        apply_encoding(&mut response);

        Ok((rule.name.clone(), response, delay))
    }

    /// First entry whose condition renders to exactly `"true"`.
    async fn select_conditional<'a>(
        &self,
        conditional: &'a ConditionalResponse,
        ctx: &RequestContext,
    ) -> Option<&'a ConditionalResponseValue> {
        for (i, value) in conditional.response.iter().enumerate() {
            let rendered = self
                .render_field(&conditional.templating_engine, &value.condition, ctx, "condition")
                .await;
            if rendered.as_deref() == Some("true") {
                debug!(index = i, "Conditional response selected");
                return Some(value);
            }
        }
        None
    }

    /// Render content type, status, headers, cookies and body, in that order.
    async fn render_response(
        &self,
        engine: &str,
        template: &ResponseTemplate,
        ctx: &RequestContext,
    ) -> MockResponse {
        let mut response = MockResponse {
            content_type: template.content_type.clone(),
            status: self.render_status(engine, &template.status, ctx).await,
            ..Default::default()
        };

        for header in &template.headers {
            let name = self.render_field(engine, &header.name, ctx, "header name").await;
            let value = self.render_field(engine, &header.value, ctx, "header value").await;
            if let (Some(name), Some(value)) = (name, value) {
                response.headers.push((name, value));
            }
        }

        for cookie in &template.cookies {
            if let Some(set_cookie) = self.render_cookie(engine, cookie, ctx).await {
                response.cookies.push(set_cookie);
            }
        }

        if let Some(body) = &template.body {
            response.body = self
                .render_field(engine, body, ctx, "body")
                .await
                .map(String::into_bytes);
        }

        response
    }

    async fn render_status(&self, engine: &str, status: &StatusSpec, ctx: &RequestContext) -> u16 {
        let template = match status {
            StatusSpec::Code(code) => return *code,
            StatusSpec::Template(template) => template,
        };
        let Some(rendered) = self.render_field(engine, template, ctx, "status").await else {
            return FALLBACK_STATUS;
        };
        match rendered.trim().parse::<u16>() {
            Ok(code) if (100..=599).contains(&code) => code,
            _ => {
                warn!(status = %rendered, "Rendered status is not a valid code, using {}", FALLBACK_STATUS);
                FALLBACK_STATUS
            }
        }
    }

    /// Build a `Set-Cookie` value. Name, value and every property key and
    /// value are templates.
    async fn render_cookie(
        &self,
        engine: &str,
        cookie: &CookieSpec,
        ctx: &RequestContext,
    ) -> Option<String> {
        let name = self.render_field(engine, &cookie.name, ctx, "cookie name").await?;
        let value = self.render_field(engine, &cookie.value, ctx, "cookie value").await?;
        let mut set_cookie = format!("{}={}", name, value);

        for (key, raw) in &cookie.properties {
            let Some(key) = self.render_field(engine, key, ctx, "cookie property").await else {
                continue;
            };
            let value = match raw {
                serde_json::Value::Null => continue,
                serde_json::Value::String(template) => {
                    match self.render_field(engine, template, ctx, "cookie property").await {
                        Some(value) => value,
                        None => continue,
                    }
                }
                other => other.to_string(),
            };

            let attribute = match key.as_str() {
                "domain" => Some(format!("Domain={}", value)),
                "expires" => Some(format!("Expires={}", value)),
                "maxAge" => Some(format!("Max-Age={}", value)),
                "path" => Some(format!("Path={}", value)),
                "sameSite" => Some(format!("SameSite={}", value)),
                "httpOnly" => is_enabled(&value).then(|| "HttpOnly".to_string()),
                "secure" => is_enabled(&value).then(|| "Secure".to_string()),
                other => {
                    warn!(cookie = %name, property = other, "Ignoring unknown cookie property");
                    None
                }
            };
            if let Some(attribute) = attribute {
                set_cookie.push_str("; ");
                set_cookie.push_str(&attribute);
            }
        }

        Some(set_cookie)
    }

    /// Intended total delay for the selected response.
    async fn compute_latency(
        &self,
        engine: &str,
        template: &ResponseTemplate,
        ctx: &RequestContext,
    ) -> Duration {
        let latency = if let Some(fixed) = &template.fixed_latency {
            match &fixed.value {
                LatencyValue::Millis(ms) => Latency::Fixed(*ms),
                LatencyValue::Template(value) => {
                    let rendered = self.render_field(engine, value, ctx, "fixedLatency").await;
                    match rendered.as_deref().map(|s| s.trim().parse::<u64>()) {
                        Some(Ok(ms)) => Latency::Fixed(ms),
                        Some(Err(_)) => {
                            warn!(value = ?rendered, "Latency is not a number of milliseconds, using 0");
                            Latency::Fixed(0)
                        }
                        None => Latency::Fixed(0),
                    }
                }
            }
        } else if let Some(random) = &template.random_latency {
            Latency::Random {
                min: random.min,
                max: random.max,
            }
        } else {
            return Duration::ZERO;
        };

        latency.duration()
    }

    /// Render one field, logging and returning `None` on failure.
    async fn render_field(
        &self,
        engine: &str,
        template: &str,
        ctx: &RequestContext,
        field: &'static str,
    ) -> Option<String> {
        match self.templates.render(engine, template, ctx).await {
            Ok(rendered) => Some(rendered),
            Err(e) => {
                warn!(field, engine, error = %e, "Template render failed");
                None
            }
        }
    }
}

fn is_enabled(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Compress the body according to the rendered `content-encoding` header.
/// Unsupported encodings are dropped so the body goes out as-is.
fn apply_encoding(response: &mut MockResponse) {
    let Some(position) = response
        .headers
        .iter()
        .position(|(name, _)| name.eq_ignore_ascii_case("content-encoding"))
    else {
        return;
    };
    let encoding = response.headers[position].1.trim().to_ascii_lowercase();

    if !matches!(encoding.as_str(), "gzip" | "deflate") {
        warn!(encoding = %encoding, "Unsupported content-encoding, sending body uncompressed");
        response.headers.remove(position);
        return;
    }

    // A missing body is compressed as empty so the header stays truthful
    let body = response.body.take().unwrap_or_default();
    match encode_body(&encoding, &body) {
        Ok(encoded) => response.body = Some(encoded),
        Err(e) => {
            warn!(encoding = %encoding, error = %e, "Compression failed, sending body uncompressed");
            response.headers.remove(position);
            response.body = Some(body);
        }
    }
}

fn encode_body(encoding: &str, body: &[u8]) -> io::Result<Vec<u8>> {
    match encoding {
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported encoding {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{TemplateError, TemplatingEngine};
    use crate::validate::SchemaValidator;
    use async_trait::async_trait;
    use std::io::Read;
    use std::path::Path;
    use tempfile::TempDir;

    const RULES: &[(&str, &str)] = &[
        (
            "hello.yaml",
            r#"
name: hello
request: { method: GET, path: /hello }
response:
  contentType: text/plain
  body: "Hello, {{default query.name \"World\"}}!"
"#,
        ),
        (
            "user.yaml",
            r#"
name: user
request: { method: GET, path: /users/:id }
response:
  contentType: application/json
  status: "{{#if (eq params.id \"0\")}}404{{else}}200{{/if}}"
  headers:
    - name: X-User-{{params.id}}
      value: "{{method}}"
  cookies:
    - name: last_user
      value: "{{params.id}}"
      properties:
        httpOnly: true
        maxAge: 3600
        path: /users
        secure: "false"
  body: '{"id": "{{params.id}}"}'
"#,
        ),
        (
            "login.yaml",
            r#"
name: login
request: { method: POST, path: /login }
conditionalResponse:
  response:
    - condition: "{{eq json.user \"admin\"}}"
      status: 200
      body: admin
    - condition: "{{eq json.user \"guest\"}}"
      status: 200
      body: guest
    - condition: "true"
      status: 401
      body: denied
"#,
        ),
        (
            "first.yaml",
            r#"
name: first
request: { method: GET, path: /first }
conditionalResponse:
  templatingEngine: none
  response:
    - condition: "true"
      body: A
    - condition: "true"
      body: B
"#,
        ),
        (
            "nothing.yaml",
            r#"
name: nothing
request: { method: GET, path: /nothing }
conditionalResponse:
  templatingEngine: none
  response:
    - condition: "false"
      body: never
"#,
        ),
        (
            "slow.yaml",
            r#"
name: slow
request: { method: GET, path: /slow }
response:
  fixedLatency:
    value: 500
  body: ok
"#,
        ),
        (
            "slow-template.yaml",
            r#"
name: slow-template
request: { method: GET, path: /slow-template }
response:
  templatingEngine: sluggish
  fixedLatency:
    value: 500
  body: ok
"#,
        ),
        (
            "overrun.yaml",
            r#"
name: overrun
request: { method: GET, path: /overrun }
response:
  templatingEngine: sluggish
  fixedLatency:
    value: 100
  body: ok
"#,
        ),
        (
            "latency-template.yaml",
            r#"
name: latency-template
request: { method: GET, path: /latency }
response:
  fixedLatency:
    value: "{{query.ms}}"
  body: ok
"#,
        ),
        (
            "gzip.yaml",
            r#"
name: gzip
request: { method: GET, path: /gzip }
response:
  headers:
    - name: Content-Encoding
      value: "{{query.encoding}}"
  body: compressed payload
"#,
        ),
        (
            "bad-clock.yaml",
            r#"
name: bad-clock
request: { method: GET, path: /clock }
response:
  headers:
    - name: X-Clock
      value: "{{now \"%Y\"}}"
  body: "{{now \"%Q\"}}"
"#,
        ),
        (
            "empty-gzip.yaml",
            r#"
name: empty-gzip
request: { method: HEAD, path: /gzip }
response:
  headers:
    - name: Content-Encoding
      value: gzip
"#,
        ),
        (
            "broken.yaml",
            r#"
name: broken
request: { method: GET, path: /broken }
response:
  templatingEngine: mustache
  status: "{{code}}"
  headers:
    - name: X-Kept
      value: plain
  body: "{{body}}"
"#,
        ),
    ];

    /// Identity engine that takes 200ms per field.
    struct SluggishEngine;

    #[async_trait]
    impl TemplatingEngine for SluggishEngine {
        fn name(&self) -> &str {
            "sluggish"
        }

        async fn render(
            &self,
            template: &str,
            _ctx: &RequestContext,
        ) -> Result<String, TemplateError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(template.to_string())
        }
    }

    async fn engine(dir: &Path) -> MockEngine {
        std::fs::write(dir.join("index.yaml"), "- name: api\n  rules: [rules/*.yaml]\n").unwrap();
        std::fs::create_dir_all(dir.join("rules")).unwrap();
        for (file, contents) in RULES {
            std::fs::write(dir.join("rules").join(file), contents).unwrap();
        }

        let store = Store::open(dir.join("index.yaml"), Arc::new(SchemaValidator));
        assert_eq!(store.get_project("api").await.unwrap().rules.len(), RULES.len());

        let mut templates = TemplateRegistry::new();
        templates.register(Arc::new(SluggishEngine));
        MockEngine::new(store, templates, DispatchSettings::default())
    }

    async fn get(engine: &MockEngine, request: MockRequest) -> Result<MockResponse, DispatchError> {
        engine.dispatch("api", &request, Instant::now()).await
    }

    fn body(response: &MockResponse) -> &str {
        std::str::from_utf8(response.body.as_deref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_renders_plain_response() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let response = get(&engine, MockRequest::new("GET", "/hello")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type.as_deref(), Some("text/plain"));
        assert_eq!(body(&response), "Hello, World!");

        let response = get(&engine, MockRequest::new("get", "/hello").with_query("name=Ada"))
            .await
            .unwrap();
        assert_eq!(body(&response), "Hello, Ada!");
    }

    #[tokio::test]
    async fn test_renders_status_headers_and_cookies() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let response = get(&engine, MockRequest::new("GET", "/users/42")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("x-user-42"), Some("GET"));
        assert_eq!(
            response.cookies,
            vec!["last_user=42; HttpOnly; Max-Age=3600; Path=/users".to_string()]
        );
        assert_eq!(body(&response), r#"{"id": "42"}"#);

        let response = get(&engine, MockRequest::new("GET", "/users/0")).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_conditional_response_selection() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let login = |user: &str| {
            MockRequest::new("POST", "/login")
                .with_header("Content-Type", "application/json")
                .with_body(format!(r#"{{"user": "{}"}}"#, user))
        };

        let response = get(&engine, login("guest")).await.unwrap();
        assert_eq!(body(&response), "guest");

        let response = get(&engine, login("mallory")).await.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(body(&response), "denied");

        // First match wins
        let response = get(&engine, MockRequest::new("GET", "/first")).await.unwrap();
        assert_eq!(body(&response), "A");
    }

    #[tokio::test]
    async fn test_unmatched_conditional_is_not_found() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let err = get(&engine, MockRequest::new("GET", "/nothing")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoConditionMatched { ref rule } if rule == "nothing"));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unknown_route_and_project() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let err = get(&engine, MockRequest::new("DELETE", "/hello")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoMatchingRule { .. }));

        let err = engine
            .dispatch("missing", &MockRequest::new("GET", "/hello"), Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Store(StoreError::ProjectNotFound(_))
        ));

        assert_eq!(engine.total_requests(), 2);
        assert_eq!(engine.total_unmatched(), 2);
        assert_eq!(engine.total_matched(), 0);
    }

    #[tokio::test]
    async fn test_render_failures_fall_back() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let response = get(&engine, MockRequest::new("GET", "/broken")).await.unwrap();
        assert_eq!(response.status, FALLBACK_STATUS);
        assert!(response.headers.is_empty());
        assert!(response.body.is_none());
        assert_eq!(engine.total_matched(), 1);
    }

    #[tokio::test]
    async fn test_invalid_time_format_falls_back() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(engine(temp.path()).await);

        // Run on its own task so a panic would surface as a join error
        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { get(&engine, MockRequest::new("GET", "/clock")).await }
        });
        let response = task.await.unwrap().unwrap();

        assert_eq!(response.status, 200);
        assert!(response.body.is_none());
        assert_eq!(response.header("x-clock").map(str::len), Some(4));
    }

    #[tokio::test]
    async fn test_encoding_without_body_sends_empty_stream() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let response = get(&engine, MockRequest::new("HEAD", "/gzip")).await.unwrap();
        assert_eq!(response.header("content-encoding"), Some("gzip"));
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(response.body.as_deref().unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_gzip_and_deflate_encoding() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let response = get(&engine, MockRequest::new("GET", "/gzip").with_query("encoding=gzip"))
            .await
            .unwrap();
        assert_eq!(response.header("content-encoding"), Some("gzip"));
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(response.body.as_deref().unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "compressed payload");

        let response = get(&engine, MockRequest::new("GET", "/gzip").with_query("encoding=deflate"))
            .await
            .unwrap();
        let mut decoded = String::new();
        flate2::read::ZlibDecoder::new(response.body.as_deref().unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "compressed payload");
    }

    #[tokio::test]
    async fn test_unsupported_encoding_is_stripped() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let response = get(&engine, MockRequest::new("GET", "/gzip").with_query("encoding=br"))
            .await
            .unwrap();
        assert_eq!(response.header("content-encoding"), None);
        assert_eq!(body(&response), "compressed payload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_latency_measured_from_arrival() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let start = Instant::now();
        let response = get(&engine, MockRequest::new("GET", "/slow")).await.unwrap();
        assert_eq!(body(&response), "ok");
        assert_eq!(start.elapsed(), Duration::from_millis(500));

        // 200ms of rendering is absorbed by the 500ms latency
        let start = Instant::now();
        get(&engine, MockRequest::new("GET", "/slow-template")).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_extra_delay_when_processing_overruns() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let start = Instant::now();
        get(&engine, MockRequest::new("GET", "/overrun")).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_templated_latency() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path()).await;

        let start = Instant::now();
        get(&engine, MockRequest::new("GET", "/latency").with_query("ms=250"))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(250));

        // Unparseable values mean no delay
        let start = Instant::now();
        get(&engine, MockRequest::new("GET", "/latency").with_query("ms=soon"))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_request_context() {
        let request = MockRequest::new("POST", "/users/7")
            .with_query("page=2")
            .with_header("Cookie", "session=abc; theme=dark")
            .with_header("X-Trace", "t1")
            .with_body(r#"{"name":"Ada"}"#);
        let mut params = HashMap::new();
        params.insert("id".to_string(), "7".to_string());

        let ctx = request.context(params);
        assert_eq!(ctx.params["id"], "7");
        assert_eq!(ctx.query["page"], "2");
        assert_eq!(ctx.headers["x-trace"], "t1");
        assert_eq!(ctx.cookies["theme"], "dark");
        assert_eq!(ctx.json.unwrap()["name"], "Ada");
    }

    #[test]
    fn test_encode_body_rejects_unknown() {
        let err = tokio_test::assert_err!(encode_body("br", b"x"));
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        tokio_test::assert_ok!(encode_body("gzip", b""));
    }
}
