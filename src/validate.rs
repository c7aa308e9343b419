//! Structural validation of projects, rules and the index file.
//!
//! The store runs every value through a [`Validator`] before accepting it.
//! [`SchemaValidator`] is the default implementation.

use crate::model::{
    Conflict, CookieSpec, IndexFile, Project, ResponseTemplate, Rule, RuleAction, StatusSpec,
    COOKIE_PROPERTIES,
};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Longest accepted project name.
pub const MAX_PROJECT_NAME_LEN: usize = 100;

const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "TRACE", "CONNECT",
];

/// A value the validator knows how to check.
#[derive(Debug, Clone, Copy)]
pub enum Validatable<'a> {
    Index(&'a IndexFile),
    Project(&'a Project),
    Rule(&'a Rule),
}

impl Validatable<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Validatable::Index(_) => "index",
            Validatable::Project(_) => "project",
            Validatable::Rule(_) => "rule",
        }
    }
}

/// One schema violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field
    pub field: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: {}", join_violations(.violations))]
pub struct ValidationError {
    pub kind: &'static str,
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Accepts a value or reports why it is malformed.
pub trait Validator: Send + Sync {
    fn validate(&self, target: Validatable<'_>) -> Result<(), ValidationError>;
}

/// Built-in validator for the rule file and index file schemas.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, target: Validatable<'_>) -> Result<(), ValidationError> {
        let mut report = Report::default();
        match target {
            Validatable::Index(index) => check_index(index, &mut report),
            Validatable::Project(project) => check_project(project, &mut report),
            Validatable::Rule(rule) => check_rule(rule, "", &mut report),
        }
        report.finish(target.kind())
    }
}

#[derive(Default)]
struct Report {
    violations: Vec<Violation>,
}

impl Report {
    fn push(&mut self, prefix: &str, field: &str, message: impl Into<String>) {
        let field = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        self.violations.push(Violation {
            field,
            message: message.into(),
        });
    }

    fn finish(self, kind: &'static str) -> Result<(), ValidationError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                kind,
                violations: self.violations,
            })
        }
    }
}

fn param_name_regex() -> &'static Regex {
    static PARAM: OnceLock<Regex> = OnceLock::new();
    PARAM.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

fn check_project_name(name: &str, prefix: &str, report: &mut Report) {
    if name.trim() != name {
        report.push(prefix, "name", "must not have surrounding whitespace");
    }
    let len = name.trim().chars().count();
    if len == 0 || len > MAX_PROJECT_NAME_LEN {
        report.push(
            prefix,
            "name",
            format!("must be 1 to {} characters", MAX_PROJECT_NAME_LEN),
        );
    }
}

fn check_index(index: &IndexFile, report: &mut Report) {
    let mut seen = HashSet::new();
    for (i, entry) in index.projects.iter().enumerate() {
        let prefix = format!("[{}]", i);
        check_project_name(&entry.name, &prefix, report);
        if !seen.insert(entry.name.trim()) {
            report.push(&prefix, "name", format!("duplicate project '{}'", entry.name));
        }
        for (j, pattern) in entry.rules.iter().enumerate() {
            if pattern.trim().is_empty() {
                report.push(&prefix, &format!("rules[{}]", j), "pattern must not be empty");
            }
        }
    }
}

fn check_project(project: &Project, report: &mut Report) {
    check_project_name(&project.name, "", report);

    for (i, entry) in project.rules.iter().enumerate() {
        let prefix = format!("rules[{}]", i);
        if entry.location.trim().is_empty() {
            report.push(&prefix, "location", "must not be empty");
        }
        check_rule(&entry.rule, &format!("{}.rule", prefix), report);

        let earlier = Project {
            name: project.name.clone(),
            rules: project.rules[..i].to_vec(),
        };
        match earlier.find_conflict(&entry.rule, &entry.location, None) {
            Some(Conflict::Name) => report.push(&prefix, "rule.name", "duplicate rule name"),
            Some(Conflict::Location) => report.push(&prefix, "location", "duplicate location"),
            Some(Conflict::Route) => {
                report.push(&prefix, "rule.request", "duplicate method and path")
            }
            None => {}
        }
    }
}

fn check_rule(rule: &Rule, prefix: &str, report: &mut Report) {
    if rule.name.trim().is_empty() {
        report.push(prefix, "name", "must not be empty");
    }

    let method = rule.request.method.to_ascii_uppercase();
    if !METHODS.contains(&method.as_str()) {
        report.push(
            prefix,
            "request.method",
            format!("unsupported method '{}'", rule.request.method),
        );
    }
    check_path(&rule.request.path, prefix, report);

    match rule.action() {
        Some(RuleAction::Respond(response)) => {
            if response.templating_engine.trim().is_empty() {
                report.push(prefix, "response.templatingEngine", "must not be empty");
            }
            check_template(&response.template, &join(prefix, "response"), report);
        }
        Some(RuleAction::Conditional(conditional)) => {
            let cprefix = join(prefix, "conditionalResponse");
            if conditional.templating_engine.trim().is_empty() {
                report.push(&cprefix, "templatingEngine", "must not be empty");
            }
            if conditional.response.is_empty() {
                report.push(&cprefix, "response", "must contain at least one entry");
            }
            for (i, value) in conditional.response.iter().enumerate() {
                let vprefix = format!("{}.response[{}]", cprefix, i);
                if value.condition.trim().is_empty() {
                    report.push(&vprefix, "condition", "must not be empty");
                }
                check_template(&value.template, &vprefix, report);
            }
        }
        None => report.push(
            prefix,
            "response",
            "exactly one of response or conditionalResponse is required",
        ),
    }
}

fn check_path(path: &str, prefix: &str, report: &mut Report) {
    if !path.starts_with('/') {
        report.push(prefix, "request.path", "must start with '/'");
        return;
    }
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    for (i, segment) in segments.iter().enumerate() {
        if let Some(name) = segment.strip_prefix(':') {
            if !param_name_regex().is_match(name) {
                report.push(
                    prefix,
                    "request.path",
                    format!("invalid parameter name '{}'", name),
                );
            }
        } else if *segment == "*" && i + 1 != segments.len() {
            report.push(prefix, "request.path", "'*' is only allowed as the last segment");
        }
    }
}

fn check_template(template: &ResponseTemplate, prefix: &str, report: &mut Report) {
    if template.fixed_latency.is_some() && template.random_latency.is_some() {
        report.push(
            prefix,
            "fixedLatency",
            "fixedLatency and randomLatency are mutually exclusive",
        );
    }
    if let Some(random) = &template.random_latency {
        if random.max < 1 {
            report.push(prefix, "randomLatency.max", "must be at least 1");
        }
        if random.max < random.min {
            report.push(prefix, "randomLatency.max", "must not be lower than min");
        }
    }
    if let StatusSpec::Code(code) = template.status {
        if !(100..=599).contains(&code) {
            report.push(prefix, "status", format!("invalid status code {}", code));
        }
    }
    for (i, header) in template.headers.iter().enumerate() {
        if header.name.trim().is_empty() {
            report.push(prefix, &format!("headers[{}].name", i), "must not be empty");
        }
    }
    for (i, cookie) in template.cookies.iter().enumerate() {
        check_cookie(cookie, &format!("{}.cookies[{}]", prefix, i), report);
    }
    for key in template.unknown.keys() {
        report.push(prefix, key, "unknown field");
    }
}

fn check_cookie(cookie: &CookieSpec, prefix: &str, report: &mut Report) {
    if cookie.name.trim().is_empty() {
        report.push(prefix, "name", "must not be empty");
    }
    for key in cookie.properties.keys() {
        if !COOKIE_PROPERTIES.contains(&key.as_str()) {
            report.push(
                prefix,
                &format!("properties.{}", key),
                "unknown cookie property",
            );
        }
    }
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::rule;
    use crate::model::{
        ConditionalResponse, FixedLatency, IndexEntry, LatencyValue, ProjectRule, RandomLatency,
    };

    fn validate_rule(rule: &Rule) -> Result<(), ValidationError> {
        SchemaValidator.validate(Validatable::Rule(rule))
    }

    #[test]
    fn test_valid_rule() {
        assert!(validate_rule(&rule("hello", "GET", "/users/:id", "hi")).is_ok());
        assert!(validate_rule(&rule("files", "get", "/static/*", "hi")).is_ok());
    }

    #[test]
    fn test_rejects_bad_request_matcher() {
        let err = validate_rule(&rule("", "FETCH", "users", "x")).unwrap_err();
        assert_eq!(err.kind, "rule");
        let fields: Vec<_> = err.violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "request.method", "request.path"]);

        let err = validate_rule(&rule("r", "GET", "/a/*/b", "x")).unwrap_err();
        assert_eq!(err.violations[0].field, "request.path");

        let err = validate_rule(&rule("r", "GET", "/a/:1x", "x")).unwrap_err();
        assert!(err.violations[0].message.contains("1x"));
    }

    #[test]
    fn test_rejects_response_and_conditional() {
        let mut both = rule("r", "GET", "/", "x");
        both.conditional_response = Some(ConditionalResponse {
            templating_engine: "none".to_string(),
            response: vec![],
        });
        let err = validate_rule(&both).unwrap_err();
        assert_eq!(err.violations[0].field, "response");

        let mut empty = rule("r", "GET", "/", "x");
        empty.response = None;
        empty.conditional_response = Some(ConditionalResponse {
            templating_engine: "none".to_string(),
            response: vec![],
        });
        let err = validate_rule(&empty).unwrap_err();
        assert_eq!(err.violations[0].field, "conditionalResponse.response");
    }

    #[test]
    fn test_rejects_latency_combinations() {
        let mut r = rule("r", "GET", "/", "x");
        let template = &mut r.response.as_mut().unwrap().template;
        template.fixed_latency = Some(FixedLatency {
            value: LatencyValue::Millis(10),
        });
        template.random_latency = Some(RandomLatency { min: 5, max: 0 });

        let err = validate_rule(&r).unwrap_err();
        let messages: Vec<_> = err.violations.iter().map(|v| v.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "fixedLatency and randomLatency are mutually exclusive",
                "must be at least 1",
                "must not be lower than min",
            ]
        );
    }

    #[test]
    fn test_rejects_unknown_cookie_property() {
        let yaml = r#"
name: r
request: { method: GET, path: / }
response:
  cookies:
    - name: c
      value: v
      properties:
        sameSite: Lax
        color: blue
"#;
        let r: Rule = serde_yaml::from_str(yaml).unwrap();
        let err = validate_rule(&r).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "response.cookies[0].properties.color");
    }

    #[test]
    fn test_rejects_misspelled_response_fields() {
        let yaml = r#"
name: r
request: { method: GET, path: / }
conditionalResponse:
  response:
    - condition: "true"
      bdy: hi
"#;
        let r: Rule = serde_yaml::from_str(yaml).unwrap();
        let err = validate_rule(&r).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "conditionalResponse.response[0].bdy");
        assert_eq!(err.violations[0].message, "unknown field");
    }

    #[test]
    fn test_project_name_bounds() {
        let ok = Project::new("shop");
        assert!(SchemaValidator.validate(Validatable::Project(&ok)).is_ok());

        let long = "x".repeat(101);
        for bad in ["", "  ", " padded", long.as_str()] {
            let project = Project::new(bad);
            assert!(
                SchemaValidator.validate(Validatable::Project(&project)).is_err(),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_project_uniqueness() {
        let mut project = Project::new("p");
        project.rules.push(ProjectRule {
            location: "a.yaml".to_string(),
            rule: rule("a", "GET", "/a", "x"),
        });
        project.rules.push(ProjectRule {
            location: "b.yaml".to_string(),
            rule: rule("b", "GET", "/a", "x"),
        });

        let err = SchemaValidator
            .validate(Validatable::Project(&project))
            .unwrap_err();
        assert_eq!(err.violations[0].field, "rules[1].rule.request");
    }

    #[test]
    fn test_index_duplicates() {
        let index = IndexFile {
            projects: vec![
                IndexEntry {
                    name: "p".to_string(),
                    rules: vec!["*.yaml".to_string()],
                },
                IndexEntry {
                    name: "p".to_string(),
                    rules: vec!["".to_string()],
                },
            ],
        };
        let err = SchemaValidator.validate(Validatable::Index(&index)).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.to_string().starts_with("invalid index: [1].name"));
    }
}
