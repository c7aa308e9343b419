//! Request matching logic.
//!
//! Resolves an incoming method and path to the project rule that serves it.

use crate::model::{ProjectRule, Rule};
use std::collections::HashMap;

/// Result of matching a request against a project's rules.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    /// The matched rule
    pub rule: &'a Rule,
    /// Path parameters bound by the rule's path template
    pub params: HashMap<String, String>,
}

/// A compiled rule path such as `/users/:id/posts/*`.
#[derive(Debug, Clone, PartialEq)]
pub struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

#[derive(Debug, Clone, PartialEq)]
enum TemplateSegment {
    Literal(String),
    Param(String),
    /// Matches the rest of the path, including nothing
    Wildcard,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Self {
        let segments = split_path(template)
            .map(|segment| {
                if segment == "*" {
                    TemplateSegment::Wildcard
                } else if let Some(name) = segment.strip_prefix(':') {
                    TemplateSegment::Param(name.to_string())
                } else {
                    TemplateSegment::Literal(segment.to_string())
                }
            })
            .collect();

        Self { segments }
    }

    /// Match a request path, binding parameters positionally.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut parts = split_path(path);

        for segment in &self.segments {
            match segment {
                TemplateSegment::Wildcard => return Some(params),
                TemplateSegment::Literal(lit) => {
                    if parts.next()? != lit.as_str() {
                        return None;
                    }
                }
                TemplateSegment::Param(name) => {
                    let value = parts.next()?;
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), percent_decode(value));
                }
            }
        }

        // Must consume entire path
        if parts.next().is_none() {
            Some(params)
        } else {
            None
        }
    }
}

/// Path segments after the leading slash. A trailing slash is ignored, so
/// `/users/` and `/users` are the same path.
fn split_path(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    let empty = trimmed.is_empty();
    trimmed.split('/').filter(move |_| !empty)
}

/// Find the rule serving `method` and `path`. Rules are tried in order and
/// the first match wins.
pub fn resolve<'a>(rules: &'a [ProjectRule], method: &str, path: &str) -> Option<RouteMatch<'a>> {
    rules.iter().find_map(|entry| {
        let rule = &entry.rule;
        if !rule.request.method.eq_ignore_ascii_case(method) {
            return None;
        }
        PathTemplate::parse(&rule.request.path)
            .matches(path)
            .map(|params| RouteMatch { rule, params })
    })
}

/// Parse a query string into key-value pairs.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = part.split_once('=') {
            params.insert(form_decode(key), form_decode(value));
        } else {
            params.insert(form_decode(part), String::new());
        }
    }

    params
}

/// Parse a `Cookie` request header into name-value pairs.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

fn form_decode(s: &str) -> String {
    percent_decode(&s.replace('+', " "))
}

/// Decode `%XX` escapes. Invalid escapes are kept as-is.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}
