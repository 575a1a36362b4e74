//! `${dotted.path}` template interpolation.
//!
//! Provider metadata (URLs, query params, request bodies, headers) may
//! reference values from the connection config with `${path.to.value}`
//! tokens. Tokens resolve against a JSON object; nested objects are reached
//! with dots. A missing key is never substituted with an empty string --
//! callers get the full list of unresolved keys so the failure can name
//! both the template and the offending map.

use crate::error::AuthError;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// How substituted values are written into the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encode {
    /// Values are inserted verbatim.
    None,
    /// Each substituted value is URL-component encoded individually. The
    /// literal parts of the template are left untouched.
    UrlComponent,
}

/// Substitutes every `${...}` token in `template` from `ctx`.
///
/// Returns `invalid_connection_config` naming the template and every key
/// that did not resolve.
pub fn interpolate(template: &str, ctx: &Map<String, Value>, encode: Encode) -> Result<String, AuthError> {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();

    for segment in tokenize(template) {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Token(path) => match lookup(ctx, path) {
                Some(value) => match encode {
                    Encode::None => out.push_str(&value),
                    Encode::UrlComponent => out.push_str(&urlencoding::encode(&value)),
                },
                None => missing.push(path.to_string()),
            },
        }
    }

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(AuthError::InvalidConnectionConfig {
            template: template.to_string(),
            keys: missing,
        })
    }
}

/// Returns every `${...}` key in `template` that does not resolve in `ctx`.
pub fn missing_keys(template: &str, ctx: &Map<String, Value>) -> Vec<String> {
    tokenize(template)
        .filter_map(|segment| match segment {
            Segment::Token(path) if lookup(ctx, path).is_none() => Some(path.to_string()),
            _ => None,
        })
        .collect()
}

/// Interpolates every value of a string map. Keys are copied verbatim.
pub fn interpolate_map(
    map: &HashMap<String, String>,
    ctx: &Map<String, Value>,
    encode: Encode,
) -> Result<HashMap<String, String>, AuthError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), interpolate(v, ctx, encode)?)))
        .collect()
}

enum Segment<'a> {
    Literal(&'a str),
    Token(&'a str),
}

/// Splits a template into literal runs and `${...}` token paths.
/// An unterminated `${` is treated as a literal.
fn tokenize(template: &str) -> impl Iterator<Item = Segment<'_>> {
    let mut rest = template;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        if let Some(start) = rest.find("${") {
            if start > 0 {
                let (literal, tail) = rest.split_at(start);
                rest = tail;
                return Some(Segment::Literal(literal));
            }
            match rest.find('}') {
                Some(end) => {
                    let token = &rest[2..end];
                    rest = &rest[end + 1..];
                    Some(Segment::Token(token.trim()))
                }
                None => {
                    let literal = rest;
                    rest = "";
                    Some(Segment::Literal(literal))
                }
            }
        } else {
            let literal = rest;
            rest = "";
            Some(Segment::Literal(literal))
        }
    })
}

/// Resolves a dotted path in `ctx`. The legacy `connectionConfig.` prefix is
/// an alias for the bare key.
fn lookup(ctx: &Map<String, Value>, path: &str) -> Option<String> {
    let path = path.strip_prefix("connectionConfig.").unwrap_or(path);

    let mut current: &Value = ctx.get(path.split('.').next()?)?;
    for part in path.split('.').skip(1) {
        current = current.get(part)?;
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
