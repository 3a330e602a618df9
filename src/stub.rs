//! Stub, query and output types plus stub-file loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Generic value tree keyed by field name.
pub type Fields = Map<String, Value>;

/// One of the four ways a rule is compared against a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Equals,
    EqualsUnordered,
    Contains,
    Matches,
}

impl Mode {
    /// Every mode, in the order they are tried.
    pub const PRIORITY: [Mode; 4] = [
        Mode::Equals,
        Mode::EqualsUnordered,
        Mode::Contains,
        Mode::Matches,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Equals => "equals",
            Mode::EqualsUnordered => "equals_unordered",
            Mode::Contains => "contains",
            Mode::Matches => "matches",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Up to four match rules; by convention only one is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals_unordered: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<Fields>,
}

impl Rules {
    pub fn get(&self, mode: Mode) -> Option<&Fields> {
        match mode {
            Mode::Equals => self.equals.as_ref(),
            Mode::EqualsUnordered => self.equals_unordered.as_ref(),
            Mode::Contains => self.contains.as_ref(),
            Mode::Matches => self.matches.as_ref(),
        }
    }

    /// The rules that are set, in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (Mode, &Fields)> + '_ {
        Mode::PRIORITY
            .into_iter()
            .filter_map(|mode| self.get(mode).map(|rule| (mode, rule)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(flatten)]
    pub rules: Rules,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Rules>,
}

/// Canned response: a payload, a stream of payloads, or a failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Fields>,
    /// Messages for server-streaming methods, sent in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<Vec<Fields>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub headers: Fields,
}

impl Output {
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.stream.is_none() && self.error.is_empty() && self.code.is_none()
    }

    /// Whether this output describes a failed call.
    pub fn is_failure(&self) -> bool {
        match self.code {
            Some(code) => code != 0,
            None => !self.error.is_empty(),
        }
    }

    /// Payload for single-response calls.
    pub fn message(&self) -> Fields {
        self.data
            .clone()
            .or_else(|| self.stream.as_ref().and_then(|s| s.first().cloned()))
            .unwrap_or_default()
    }

    /// Payloads for server-streaming calls.
    pub fn messages(&self) -> Vec<Fields> {
        match (&self.stream, &self.data) {
            (Some(stream), _) => stream.clone(),
            (None, Some(data)) => vec![data.clone()],
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stub {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub input: Input,
    #[serde(default)]
    pub output: Output,
}

impl Stub {
    /// Check required parts, compile `matches` patterns and normalize the
    /// method name.
    pub fn validate(mut self) -> Result<Self, StubError> {
        if self.service.trim().is_empty() {
            return Err(StubError::MissingService);
        }
        if self.method.trim().is_empty() {
            return Err(StubError::MissingMethod);
        }
        if self.input.rules.is_empty() {
            return Err(StubError::MissingInput);
        }
        if self.output.is_empty() {
            return Err(StubError::MissingOutput);
        }
        for rules in std::iter::once(&self.input.rules).chain(self.input.headers.as_ref()) {
            if let Some(rule) = &rules.matches {
                check_patterns(rule)?;
            }
        }
        self.method = title_case(&self.method);
        Ok(self)
    }
}

/// Decoded form of one live call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub data: Fields,
    #[serde(default)]
    pub headers: Fields,
}

#[derive(Debug, Error)]
pub enum StubError {
    #[error("service name can't be empty")]
    MissingService,
    #[error("method name can't be empty")]
    MissingMethod,
    #[error("input can't be empty")]
    MissingInput,
    #[error("output can't be empty")]
    MissingOutput,
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{0}")]
    NotFound(NotFound),
}

/// Diagnostic for a call no stub matched.
#[derive(Debug, Clone, PartialEq)]
pub struct NotFound {
    pub service: String,
    pub method: String,
    /// The query data, rendered one field per line.
    pub input: String,
    /// Best-ranked rule that was tried, rendered the same way.
    pub closest: Option<(Mode, String)>,
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Can't find stub \n\nService: {} \n\nMethod: {} \n\nInput\n\n{}",
            self.service, self.method, self.input
        )?;
        if let Some((mode, rule)) = &self.closest {
            write!(f, "\n\nClosest Match \n\n{mode}:{rule}")?;
        }
        Ok(())
    }
}

/// Uppercase the first character; schema method names are title case.
pub fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn check_patterns(fields: &Fields) -> Result<(), StubError> {
    for value in fields.values() {
        check_pattern(value)?;
    }
    Ok(())
}

fn check_pattern(value: &Value) -> Result<(), StubError> {
    match value {
        Value::String(pattern) => crate::matcher::pattern(pattern)
            .map(drop)
            .map_err(|source| StubError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            }),
        Value::Array(items) => items.iter().try_for_each(check_pattern),
        Value::Object(fields) => check_patterns(fields),
        _ => Ok(()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Stub>),
    One(Box<Stub>),
}

/// Parse a stub document: a single stub object or an array of them.
pub fn parse_stubs(text: &str) -> serde_json::Result<Vec<Stub>> {
    Ok(match serde_json::from_str(text)? {
        OneOrMany::Many(stubs) => stubs,
        OneOrMany::One(stub) => vec![*stub],
    })
}

/// Read every `.json` stub file under `dir`, recursively.
///
/// Files are visited in path order. A file that cannot be read, parsed or
/// validated is skipped with a warning; the rest still load.
pub fn read_stub_dir(dir: &Path) -> Result<Vec<Stub>> {
    let meta = std::fs::metadata(dir)
        .with_context(|| format!("Failed to read stub directory {}", dir.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("Stub path {} is not a directory", dir.display());
    }

    let mut stubs = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable stub path");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        match read_stub_file(path) {
            Ok(loaded) => {
                debug!(path = %path.display(), count = loaded.len(), "Read stub file");
                stubs.extend(loaded);
            }
            Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "Skipping stub file"),
        }
    }
    Ok(stubs)
}

fn read_stub_file(path: &Path) -> Result<Vec<Stub>> {
    let text = std::fs::read_to_string(path).context("read failed")?;
    let stubs = parse_stubs(&text).context("invalid stub JSON")?;
    stubs
        .into_iter()
        .map(|stub| stub.validate().map_err(anyhow::Error::from))
        .collect()
}
