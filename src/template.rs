use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

// Matches {{ path }} and {{ path | filter:arg:arg }} placeholders.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("placeholder pattern"));

/// Substitute `{{path.to.value}}` placeholders in a template string using a
/// nested value mapping. Paths are dotted keys resolved by successive
/// lookups; an absent or empty value renders as the empty string unless a
/// `default` filter applies.
///
/// The filter set is closed:
/// - `mount_as:TARGET:MODE` produces `SOURCE:TARGET:MODE` when the source is
///   non-empty, else the empty string (so list-valued callers drop the entry).
/// - `default:VALUE` substitutes VALUE when the resolved value is empty.
///
/// Pure and deterministic: same template and values, same output.
pub fn evaluate(template: &str, values: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            expand_placeholder(caps[1].trim(), values)
        })
        .into_owned()
}

/// Map [`evaluate`] over a list of templates and drop empty results.
pub fn evaluate_list(templates: &[String], values: &Value) -> Vec<String> {
    templates
        .iter()
        .map(|t| evaluate(t, values))
        .filter(|v| !v.is_empty())
        .collect()
}

fn expand_placeholder(expr: &str, values: &Value) -> String {
    let mut parts = expr.split('|');
    let path = parts.next().unwrap_or_default().trim();
    let mut result = lookup(values, path).unwrap_or_default();

    for filter in parts {
        result = apply_filter(filter.trim(), &result);
    }

    result
}

/// Resolve a dotted path by successive lookups into the value tree.
/// Scalars render via their natural string form; null, missing keys, and
/// non-scalar terminals render empty.
fn lookup(values: &Value, path: &str) -> Option<String> {
    let mut current = values;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn apply_filter(spec: &str, value: &str) -> String {
    let (name, args) = match spec.split_once(':') {
        Some((name, rest)) => (name.trim(), rest),
        None => (spec, ""),
    };

    match name {
        "mount_as" => {
            if value.is_empty() {
                return String::new();
            }
            match args.rsplit_once(':') {
                Some((target, mode)) => format!("{value}:{target}:{mode}"),
                None => format!("{value}:{args}"),
            }
        }
        "default" => {
            if value.is_empty() {
                args.to_string()
            } else {
                value.to_string()
            }
        }
        // The filter set is closed; an unknown filter passes the value through.
        _ => value.to_string(),
    }
}
