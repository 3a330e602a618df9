//! Rule evaluation and closest-match ranking.

use crate::stub::{Fields, Mode, Rules};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};
use tracing::warn;

/// Compiled `matches` patterns, keyed by their source text.
static PATTERNS: LazyLock<Mutex<HashMap<String, Regex>>> = LazyLock::new(Default::default);

/// Compile `text` once; later calls reuse the cached regex.
pub fn pattern(text: &str) -> Result<Regex, regex::Error> {
    let mut cache = PATTERNS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(re) = cache.get(text) {
        return Ok(re.clone());
    }
    let re = Regex::new(text)?;
    cache.insert(text.to_string(), re.clone());
    Ok(re)
}

/// Evaluate one rule against query data.
pub fn matches(mode: Mode, rule: &Fields, data: &Fields) -> bool {
    match mode {
        Mode::Equals => map_matches(rule, data, true, &deep_equal),
        Mode::EqualsUnordered => {
            let rule = sorted_fields(rule);
            let data = sorted_fields(data);
            map_matches(&rule, &data, true, &deep_equal)
        }
        Mode::Contains => map_matches(rule, data, false, &deep_equal),
        Mode::Matches => map_matches(rule, data, false, &regex_equal),
    }
}

/// Evaluate header rules. Several modes combine with OR; none set passes.
pub fn headers_match(rules: &Rules, headers: &Fields) -> bool {
    let mut set = rules.iter().peekable();
    if set.peek().is_none() {
        return true;
    }
    set.any(|(mode, rule)| matches(mode, &lowercase_keys(rule), headers))
}

fn lowercase_keys(fields: &Fields) -> Fields {
    fields
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

type Leaf = dyn Fn(&Value, &Value) -> bool;

fn map_matches(expect: &Fields, actual: &Fields, exact: bool, leaf: &Leaf) -> bool {
    let sizes_ok = if exact {
        expect.len() == actual.len()
    } else {
        expect.len() <= actual.len()
    };
    sizes_ok
        && expect.iter().all(|(key, want)| {
            actual
                .get(key)
                .is_some_and(|got| value_matches(want, got, exact, leaf))
        })
}

fn value_matches(expect: &Value, actual: &Value, exact: bool, leaf: &Leaf) -> bool {
    match (expect, actual) {
        (Value::Array(want), Value::Array(got)) => {
            let sizes_ok = if exact {
                want.len() == got.len()
            } else {
                want.len() <= got.len()
            };
            sizes_ok
                && want
                    .iter()
                    .zip(got)
                    .all(|(w, g)| value_matches(w, g, exact, leaf))
        }
        (Value::Object(want), Value::Object(got)) => map_matches(want, got, exact, leaf),
        (Value::Array(_) | Value::Object(_), _) => false,
        _ => leaf(expect, actual),
    }
}

/// Deep equality where numbers compare by value, not by spelling.
fn deep_equal(expect: &Value, actual: &Value) -> bool {
    match (expect, actual) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                a == b
            } else if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                a == b
            } else if a.is_f64() || b.is_f64() {
                a.as_f64() == b.as_f64()
            } else {
                false
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| deep_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| deep_equal(v, other)))
        }
        _ => expect == actual,
    }
}

/// String rules are patterns over the actual value's text; anything else
/// compares by equality.
fn regex_equal(expect: &Value, actual: &Value) -> bool {
    let Value::String(pattern) = expect else {
        return deep_equal(expect, actual);
    };
    let text = match actual {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return false,
    };
    match self::pattern(pattern) {
        Ok(re) => re.is_match(&text),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Invalid match pattern");
            false
        }
    }
}

fn sorted_fields(fields: &Fields) -> Fields {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), sorted_value(v)))
        .collect()
}

/// Recursively order list items by their JSON text.
fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut items: Vec<(String, Value)> = items
                .iter()
                .map(sorted_value)
                .map(|v| (v.to_string(), v))
                .collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Array(items.into_iter().map(|(_, v)| v).collect())
        }
        Value::Object(fields) => Value::Object(sorted_fields(fields)),
        other => other.clone(),
    }
}

/// Render fields one per line, as shown in not-found diagnostics.
pub fn render_fields(fields: &Fields) -> String {
    let mut out = String::from("{\n");
    for (key, value) in fields {
        out.push('\t');
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&plain_text(value));
        out.push('\n');
    }
    out.push('}');
    out
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// True when every char of `needle` appears in `haystack`, in order.
pub fn fuzzy_match(needle: &str, haystack: &str) -> bool {
    let mut rest = haystack.chars();
    needle.chars().all(|c| rest.any(|h| h == c))
}

/// Share of a rule's keys and values that fuzzily appear in the rendered query.
pub fn rank(rendered_query: &str, rule: &Fields) -> f32 {
    if rule.is_empty() {
        return 0.0;
    }
    let hits: usize = rule
        .iter()
        .map(|(key, value)| {
            usize::from(fuzzy_match(&format!("{key}:"), rendered_query))
                + usize::from(fuzzy_match(&plain_text(value), rendered_query))
        })
        .sum();
    hits as f32 / (rule.len() * 2) as f32
}

/// Index of the best-ranked candidate: highest score, first seen on ties,
/// the first candidate when nothing scores at all.
pub fn closest<'a>(
    rendered_query: &str,
    candidates: impl IntoIterator<Item = &'a Fields>,
) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, rule) in candidates.into_iter().enumerate() {
        let score = rank(rendered_query, rule);
        match best {
            None => best = Some((i, score)),
            Some((_, top)) if score.partial_cmp(&top) == Some(Ordering::Greater) => {
                best = Some((i, score))
            }
            Some(_) => {}
        }
    }
    best.map(|(i, _)| i)
}
