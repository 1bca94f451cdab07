use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::value::Value;
use crate::version::{Pattern, VersionParseError};

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error(transparent)]
    Pattern(#[from] VersionParseError),

    #[error("expected an array of pattern strings")]
    NotAnArray,

    #[error("expected a string pattern, found a non-string array element")]
    NotAString,
}

/// A single entry of a `run_depends`/`replaces`/`conflicts`/`provides` list:
/// a package pattern (exact, relational, or glob), as described in the
/// design's version-comparison component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency(pub Pattern);

impl Dependency {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn matches(&self, pkgver: &str) -> bool {
        self.0.matches(pkgver)
    }
}

impl FromStr for Dependency {
    type Err = DependencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Dependency(s.parse()?))
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Pattern::Exact(s) => f.write_str(s),
            Pattern::Relational { name, constraint } => write!(f, "{name}{constraint}"),
            Pattern::Glob { glob, .. } => f.write_str(glob),
        }
    }
}

/// An ordered list of dependency patterns, as the design keeps `run_depends`
/// and friends (order matters for `replaces`-matching per the design's open
/// question on that field).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies(pub Vec<Dependency>);

impl Dependencies {
    pub fn iter(&self) -> std::slice::Iter<'_, Dependency> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses a `Value::Array` of pattern strings. A missing key is treated
    /// as an empty list by callers (mirrors `#[serde(default)]` on the
    /// teacher's equivalent field).
    pub fn from_value(value: &Value) -> Result<Self, DependencyError> {
        let items = value.as_array().ok_or(DependencyError::NotAnArray)?;
        let deps = items
            .iter()
            .map(|v| v.as_str().ok_or(DependencyError::NotAString)?.parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Dependencies(deps))
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().map(|d| Value::Str(d.to_string())).collect())
    }
}

impl<'a> IntoIterator for &'a Dependencies {
    type Item = &'a Dependency;
    type IntoIter = std::slice::Iter<'a, Dependency>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
#[path = "dependency.test.rs"]
mod test;
