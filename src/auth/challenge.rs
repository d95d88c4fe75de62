use std::collections::HashMap;

use crate::errors::GatewayError;

/// One authorization challenge parsed from a `WWW-Authenticate` header.
/// Parameter names are case-insensitive (stored lowercased); values
/// preserve case.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChallenge {
    pub scheme: String,
    pub parameters: HashMap<String, String>,
}

impl AuthChallenge {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn is_bearer(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("Bearer")
    }
}

/// Parse a `WWW-Authenticate` header value into an ordered challenge list.
///
/// A scheme token starts a new challenge; `name=value` tokens extend the
/// current one. Quoted strings may contain commas and `\"` escapes. Inner
/// whitespace outside quoted strings is not significant.
pub fn parse_www_authenticate(input: &str) -> Result<Vec<AuthChallenge>, GatewayError> {
    if input.trim().is_empty() {
        return Err(GatewayError::Unauthorized(
            "empty WWW-Authenticate header".to_string(),
        ));
    }

    let mut challenges: Vec<AuthChallenge> = Vec::new();

    for item in split_outside_quotes(input, ',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        // A leading token without '=' is a scheme; the remainder of the
        // item, if any, is that challenge's first parameter.
        let (first, rest) = match item.split_once(char::is_whitespace) {
            Some((first, rest)) => (first, rest.trim()),
            None => (item, ""),
        };

        if !first.contains('=') {
            challenges.push(AuthChallenge {
                scheme: first.to_string(),
                parameters: HashMap::new(),
            });
            if !rest.is_empty() {
                push_param(&mut challenges, rest)?;
            }
        } else {
            push_param(&mut challenges, item)?;
        }
    }

    if challenges.is_empty() {
        return Err(GatewayError::Unauthorized(
            "no authorization scheme in WWW-Authenticate header".to_string(),
        ));
    }

    Ok(challenges)
}

/// The `resource_metadata` parameter of the first Bearer challenge.
pub fn find_resource_metadata_url(challenges: &[AuthChallenge]) -> Option<String> {
    challenges
        .iter()
        .filter(|c| c.is_bearer())
        .find_map(|c| c.param("resource_metadata").map(str::to_string))
}

/// The whitespace-split `scope` parameter of the first Bearer challenge.
pub fn find_required_scopes(challenges: &[AuthChallenge]) -> Vec<String> {
    challenges
        .iter()
        .find(|c| c.is_bearer())
        .and_then(|c| c.param("scope"))
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn push_param(challenges: &mut [AuthChallenge], item: &str) -> Result<(), GatewayError> {
    let current = challenges.last_mut().ok_or_else(|| {
        GatewayError::Unauthorized(format!(
            "challenge parameter '{item}' before any authorization scheme"
        ))
    })?;

    let (name, value) = item.split_once('=').ok_or_else(|| {
        GatewayError::Unauthorized(format!("malformed challenge parameter '{item}'"))
    })?;

    current.parameters.insert(
        name.trim().to_ascii_lowercase(),
        unquote(value.trim()),
    );
    Ok(())
}

/// Split on a separator, ignoring separators inside double-quoted strings.
fn split_outside_quotes(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in input.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => {
                current.push(ch);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            c if c == sep && !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Strip surrounding double quotes and resolve `\"` / `\\` escapes.
fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    out
}
