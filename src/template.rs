//! Templating engines for dynamic responses.
//!
//! Rules pick an engine by name through their `templatingEngine` field.
//! `handlebars` renders with request context, `none` returns the template
//! text unchanged.

use async_trait::async_trait;
use chrono::Utc;
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, RenderError,
    RenderErrorReason,
};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    #[error("unknown templating engine '{0}'")]
    UnknownEngine(String),

    #[error("template render failed: {0}")]
    Render(String),
}

/// Context for template rendering, derived from the incoming request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
    /// Path parameters bound by the rule's path template
    pub params: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers, names lowercased
    pub headers: HashMap<String, String>,
    /// Request cookies
    pub cookies: HashMap<String, String>,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl RequestContext {
    /// Attach a raw request body, parsing it as JSON when possible.
    pub fn with_body(mut self, body: &[u8]) -> Self {
        if body.is_empty() {
            return self;
        }
        let text = String::from_utf8_lossy(body).into_owned();
        self.json = serde_json::from_str(&text).ok();
        self.body = Some(text);
        self
    }
}

/// A pluggable template renderer.
#[async_trait]
pub trait TemplatingEngine: Send + Sync {
    /// Identifier rules use to select this engine.
    fn name(&self) -> &str;

    async fn render(&self, template: &str, ctx: &RequestContext) -> Result<String, TemplateError>;
}

/// Handlebars-backed engine with the mock helpers registered.
pub struct HandlebarsEngine {
    handlebars: Handlebars<'static>,
}

impl HandlebarsEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        for (name, helper) in HELPERS {
            handlebars.register_helper(name, Box::new(ValueHelper(helper)));
        }

        // Responses are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    fn render_sync(&self, template: &str, ctx: &RequestContext) -> Result<String, TemplateError> {
        self.handlebars
            .render_template(template, ctx)
            .map_err(|e| TemplateError::Render(e.to_string()))
    }
}

impl Default for HandlebarsEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplatingEngine for HandlebarsEngine {
    fn name(&self) -> &str {
        "handlebars"
    }

    async fn render(&self, template: &str, ctx: &RequestContext) -> Result<String, TemplateError> {
        // Plain text never needs the parser
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        self.render_sync(template, ctx)
    }
}

/// The `none` engine: templates are returned verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityEngine;

#[async_trait]
impl TemplatingEngine for IdentityEngine {
    fn name(&self) -> &str {
        "none"
    }

    async fn render(&self, template: &str, _ctx: &RequestContext) -> Result<String, TemplateError> {
        Ok(template.to_string())
    }
}

/// Engines available to rules, keyed by name.
#[derive(Clone)]
pub struct TemplateRegistry {
    engines: HashMap<String, Arc<dyn TemplatingEngine>>,
}

impl TemplateRegistry {
    /// Registry with the built-in `handlebars` and `none` engines.
    pub fn new() -> Self {
        let mut registry = Self {
            engines: HashMap::new(),
        };
        registry.register(Arc::new(HandlebarsEngine::new()));
        registry.register(Arc::new(IdentityEngine));
        registry
    }

    /// Add or replace an engine under its own name.
    pub fn register(&mut self, engine: Arc<dyn TemplatingEngine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TemplatingEngine>> {
        self.engines.get(name).cloned()
    }

    /// Render with the named engine.
    pub async fn render(
        &self,
        engine: &str,
        template: &str,
        ctx: &RequestContext,
    ) -> Result<String, TemplateError> {
        let engine = self
            .engines
            .get(engine)
            .ok_or_else(|| TemplateError::UnknownEngine(engine.to_string()))?;
        engine.render(template, ctx).await
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of a helper computed from its positional parameters.
type HelperFn = fn(&[&Value]) -> Result<String, RenderError>;

/// A helper whose output depends only on its positional parameters.
struct ValueHelper(HelperFn);

impl HelperDef for ValueHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let params: Vec<&Value> = h.params().iter().map(|p| p.value()).collect();
        out.write(&(self.0)(&params)?)?;
        Ok(())
    }
}

const HELPERS: [(&str, HelperFn); 7] = [
    ("json", json),
    ("uuid", uuid),
    ("now", now),
    ("random", random),
    ("default", default_value),
    ("upper", upper),
    ("lower", lower),
];

fn text<'a>(params: &[&'a Value], index: usize) -> &'a str {
    params.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

/// Strings holding JSON are pretty printed; structured values such as
/// `json` or `query` are serialized.
fn json(params: &[&Value]) -> Result<String, RenderError> {
    let rendered = match params.first() {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => serde_json::to_string_pretty(&parsed).unwrap_or_default(),
            Err(_) => s.clone(),
        },
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
        None => String::new(),
    };
    Ok(rendered)
}

fn upper(params: &[&Value]) -> Result<String, RenderError> {
    Ok(text(params, 0).to_uppercase())
}

fn lower(params: &[&Value]) -> Result<String, RenderError> {
    Ok(text(params, 0).to_lowercase())
}

/// Random version 4 UUID.
fn uuid(_: &[&Value]) -> Result<String, RenderError> {
    let bits: u128 = rand::thread_rng().gen();
    let bits = (bits & !(0xf << 76)) | (0x4 << 76);
    let bits = (bits & !(0x3 << 62)) | (0x2 << 62);
    let hex = format!("{:032x}", bits);
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    ))
}

/// Current UTC time in a strftime format. An invalid format fails the
/// render instead of the formatter.
fn now(params: &[&Value]) -> Result<String, RenderError> {
    let format = params
        .first()
        .and_then(|v| v.as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
    let mut rendered = String::new();
    write!(rendered, "{}", Utc::now().format(format)).map_err(|_| {
        RenderError::from(RenderErrorReason::Other(format!(
            "invalid time format '{}'",
            format
        )))
    })?;
    Ok(rendered)
}

/// Integer in `[min, max]`, defaulting to `[0, 100]`.
fn random(params: &[&Value]) -> Result<String, RenderError> {
    let min = params.first().and_then(|v| v.as_i64()).unwrap_or(0);
    let max = params.get(1).and_then(|v| v.as_i64()).unwrap_or(100);
    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    Ok(value.to_string())
}

/// First parameter unless it is missing, null or an empty string.
fn default_value(params: &[&Value]) -> Result<String, RenderError> {
    let rendered = match params.first() {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | Some(Value::String(_)) | None => text(params, 1).to_string(),
        Some(other) => other.to_string(),
    };
    Ok(rendered)
}
