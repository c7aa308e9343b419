//! Rule and project data model.
//!
//! These types mirror the on-disk rule files and index file. Everything is
//! plain owned data so the store can hand out deep copies with `Clone`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of the templating engine used when a rule does not name one.
pub const DEFAULT_TEMPLATING_ENGINE: &str = "handlebars";

/// Cookie property keys a rule may set.
pub const COOKIE_PROPERTIES: [&str; 7] = [
    "domain", "expires", "httpOnly", "maxAge", "path", "secure", "sameSite",
];

fn default_templating_engine() -> String {
    DEFAULT_TEMPLATING_ENGINE.to_string()
}

/// A single method + path to response mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rule {
    /// Rule name, unique within a project
    pub name: String,

    /// Request matcher
    pub request: RequestMatcher,

    /// Plain response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,

    /// Guarded response variants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_response: Option<ConditionalResponse>,
}

/// What a rule answers with, once its response XOR invariant holds.
#[derive(Debug, Clone, Copy)]
pub enum RuleAction<'a> {
    Respond(&'a Response),
    Conditional(&'a ConditionalResponse),
}

impl Rule {
    /// Returns the rule's action, or `None` when it has both or neither.
    pub fn action(&self) -> Option<RuleAction<'_>> {
        match (&self.response, &self.conditional_response) {
            (Some(response), None) => Some(RuleAction::Respond(response)),
            (None, Some(conditional)) => Some(RuleAction::Conditional(conditional)),
            _ => None,
        }
    }

    /// Whether two rules would answer the same method and path.
    pub fn same_route(&self, other: &Rule) -> bool {
        self.request.method.eq_ignore_ascii_case(&other.request.method)
            && self.request.path == other.request.path
    }
}

/// Request matcher: method plus a path that may contain `:param` segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    pub method: String,
    pub path: String,
}

/// A plain (non-conditional) response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default = "default_templating_engine")]
    pub templating_engine: String,

    #[serde(flatten)]
    pub template: ResponseTemplate,
}

/// The fields shared by plain responses and conditional response values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_latency: Option<FixedLatency>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_latency: Option<RandomLatency>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default)]
    pub status: StatusSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<CookieSpec>,

    #[serde(default)]
    pub body: Option<String>,

    /// Keys no field claimed. Flattened structs cannot deny unknown fields,
    /// so they are collected here and rejected by validation.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// Status code, either literal or a template that renders to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusSpec {
    Code(u16),
    Template(String),
}

impl Default for StatusSpec {
    fn default() -> Self {
        StatusSpec::Code(200)
    }
}

/// Fixed latency. The value may be a template rendering to milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedLatency {
    pub value: LatencyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LatencyValue {
    Millis(u64),
    Template(String),
}

/// Uniformly random latency in `[min, max]` milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RandomLatency {
    #[serde(default)]
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderSpec {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieSpec {
    pub name: String,
    pub value: String,

    /// Keys are limited to [`COOKIE_PROPERTIES`]; values may be templates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Ordered, guarded response variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConditionalResponse {
    #[serde(default = "default_templating_engine")]
    pub templating_engine: String,

    pub response: Vec<ConditionalResponseValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalResponseValue {
    /// Selected when this renders to exactly `"true"`
    pub condition: String,

    #[serde(flatten)]
    pub template: ResponseTemplate,
}

/// A rule together with the file it lives in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRule {
    pub location: String,
    pub rule: Rule,
}

/// A rule submitted for creation or update. A missing location is derived
/// on create and kept unchanged on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(default)]
    pub location: Option<String>,
    pub rule: Rule,
}

impl From<ProjectRule> for RuleDraft {
    fn from(project_rule: ProjectRule) -> Self {
        Self {
            location: Some(project_rule.location),
            rule: project_rule.rule,
        }
    }
}

/// A named collection of rules served together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<ProjectRule>,
}

/// Which uniqueness invariant a rule would break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Name,
    Location,
    Route,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    pub fn rule(&self, name: &str) -> Option<&ProjectRule> {
        self.rules.iter().find(|r| r.rule.name == name)
    }

    pub fn has_location(&self, location: &str) -> bool {
        self.rules.iter().any(|r| r.location == location)
    }

    /// Check a candidate rule against every entry except the one stored at
    /// `skip_location`. Name is checked first, then location, then route.
    pub fn find_conflict(
        &self,
        rule: &Rule,
        location: &str,
        skip_location: Option<&str>,
    ) -> Option<Conflict> {
        let others = || {
            self.rules
                .iter()
                .filter(move |r| Some(r.location.as_str()) != skip_location)
        };

        if others().any(|r| r.rule.name == rule.name) {
            return Some(Conflict::Name);
        }
        if others().any(|r| r.location == location) {
            return Some(Conflict::Location);
        }
        if others().any(|r| r.rule.same_route(rule)) {
            return Some(Conflict::Route);
        }
        None
    }
}

/// Root index file: projects and their rule file glob patterns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexFile {
    pub projects: Vec<IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexEntry {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<String>,
}

impl IndexFile {
    /// Index describing the given projects, one literal pattern per rule.
    /// Locations are escaped so glob metacharacters in file names match
    /// only themselves.
    pub fn from_projects(projects: &[Project]) -> Self {
        Self {
            projects: projects
                .iter()
                .map(|p| IndexEntry {
                    name: p.name.clone(),
                    rules: p
                        .rules
                        .iter()
                        .map(|r| glob::Pattern::escape(&r.location))
                        .collect(),
                })
                .collect(),
        }
    }
}
