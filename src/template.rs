//! Minimal `{{ expression }}` templates for prompts and greetings.
//!
//! An expression is a dotted path into a JSON context, optionally followed by
//! a `default('fallback')` filter. Missing values render as the empty string.
//! Block tags (`{% ... %}`), unknown filters and unterminated expressions are
//! errors, so callers can fall back to the raw text.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Result, VoiceError};

fn expression_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("static template regex"))
}

fn default_filter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^default\(\s*(?:'([^']*)'|"([^"]*)")\s*\)$"#).expect("static filter regex")
    })
}

/// Renders `template` against `context`.
pub fn render(template: &str, context: &Map<String, Value>) -> Result<String> {
    if template.contains("{%") {
        return Err(VoiceError::Template("block tags are not supported".into()));
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in expression_re().captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&evaluate(caps[1].trim(), context)?);
        last = whole.end();
    }
    let rest = &template[last..];
    if rest.contains("{{") {
        return Err(VoiceError::Template("unterminated expression".into()));
    }
    out.push_str(rest);
    Ok(out)
}

/// Renders `template`, returning the raw text when rendering fails.
pub fn render_or_raw(template: &str, context: &Map<String, Value>) -> String {
    match render(template, context) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "template rendering failed; using raw text");
            template.to_string()
        }
    }
}

fn evaluate(expression: &str, context: &Map<String, Value>) -> Result<String> {
    let mut parts = expression.splitn(2, '|');
    let path = parts.next().unwrap_or_default().trim();
    if path.is_empty() {
        return Err(VoiceError::Template("empty expression".into()));
    }
    let value = lookup(context, path).map(display).unwrap_or_default();

    match parts.next().map(str::trim) {
        None => Ok(value),
        Some(filter) => {
            let caps = default_filter_re()
                .captures(filter)
                .ok_or_else(|| VoiceError::Template(format!("unsupported filter: {}", filter)))?;
            if value.is_empty() {
                let fallback = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
                Ok(fallback.to_string())
            } else {
                Ok(value)
            }
        }
    }
}

/// Walks a dotted path such as `session_profile.full_name`.
pub fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
