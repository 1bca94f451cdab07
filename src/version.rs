use std::cmp::Ordering;
use std::str::FromStr;

use thiserror::Error;

use crate::internal::macros::bail;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid version string: '{0}'")]
pub struct VersionParseError(pub String);

/// Splits a `version[_rev]` string into components the way `cmpver` expects:
/// dot-separated alternating runs of digits and non-digits, plus a trailing
/// numeric `_rev` compared last.
fn split_rev(s: &str) -> (&str, u64) {
    match s.rsplit_once('_') {
        Some((base, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => {
            (base, rev.parse().unwrap_or(0))
        }
        _ => (s, 0),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Component<'a> {
    Numeric(u64),
    Alpha(&'a str),
}

/// The pre-release ordering table from the design: these suffixes sort
/// strictly below a bare numeric component, `pl` sorts above it, everything
/// else sorts as plain ASCII text.
fn prerelease_rank(s: &str) -> Option<i8> {
    match s {
        "alpha" => Some(-5),
        "beta" => Some(-4),
        "pre" => Some(-3),
        "rc" => Some(-2),
        "" => Some(0),
        "pl" => Some(1),
        _ => None,
    }
}

/// Splits one dot-separated segment into its alternating maximal digit/
/// non-digit runs, e.g. `"0pl1"` -> `[Numeric(0), Alpha("pl"), Numeric(1)]`.
/// A segment is not atomic: `1.0` must compare below `1.0pl1` at the second
/// position, which only works if `"0pl1"` yields a bare `Numeric(0)` there
/// followed by the `pl` tag, rather than one opaque alpha string.
fn tokenize_segment(part: &str) -> Vec<Component<'_>> {
    let bytes = part.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let is_digit = bytes[i].is_ascii_digit();
        while i < bytes.len() && bytes[i].is_ascii_digit() == is_digit {
            i += 1;
        }
        let run = &part[start..i];
        out.push(if is_digit { Component::Numeric(run.parse().unwrap_or(0)) } else { Component::Alpha(run) });
    }
    if out.is_empty() {
        out.push(Component::Alpha(""));
    }
    out
}

fn split_components(s: &str) -> Vec<Component<'_>> {
    s.split('.').flat_map(tokenize_segment).collect()
}

fn compare_alpha(a: &str, b: &str) -> Ordering {
    // A leading run of letters is treated as a pre-release tag per the
    // ordering table (`rc`, `pre`, ... ) when both sides parse as one;
    // otherwise fall back to plain ASCII comparison.
    match (prerelease_rank(a), prerelease_rank(b)) {
        (Some(ra), Some(rb)) => ra.cmp(&rb),
        _ => a.cmp(b),
    }
}

fn compare_component(a: Option<&Component>, b: Option<&Component>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (Some(Component::Numeric(x)), Some(Component::Numeric(y))) => x.cmp(y),
        (Some(Component::Alpha(x)), Some(Component::Alpha(y))) => compare_alpha(x, y),
        // Numeric beats alpha at the same position.
        (Some(Component::Numeric(_)), Some(Component::Alpha(_))) => Ordering::Greater,
        (Some(Component::Alpha(_)), Some(Component::Numeric(_))) => Ordering::Less,
        // Missing component: numerics default to 0, alphas to empty string.
        (Some(Component::Numeric(x)), None) => x.cmp(&0),
        (None, Some(Component::Numeric(y))) => 0u64.cmp(y),
        (Some(Component::Alpha(x)), None) => compare_alpha(x, ""),
        (None, Some(Component::Alpha(y))) => compare_alpha("", y),
    }
}

/// Compares two `version[_rev]` strings per the design's `cmpver` algorithm.
/// Returns `Less`/`Equal`/`Greater` (the design's -1/0/+1).
pub fn cmpver(a: &str, b: &str) -> Ordering {
    let (a_base, a_rev) = split_rev(a);
    let (b_base, b_rev) = split_rev(b);

    let a_parts = split_components(a_base);
    let b_parts = split_components(b_base);
    let len = a_parts.len().max(b_parts.len());

    for i in 0..len {
        let ord = compare_component(a_parts.get(i), b_parts.get(i));
        if ord != Ordering::Equal {
            return ord;
        }
    }

    a_rev.cmp(&b_rev)
}

/// A constraint operator, matching XBPS's relational set (distinct from
/// APK's `=,<,>,~`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Ge,
    Le,
    Gt,
    Lt,
    Eq,
    Ne,
}

impl Op {
    fn matches(self, ord: Ordering) -> bool {
        match self {
            Op::Ge => ord != Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Lt => ord == Ordering::Less,
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Op::Ge => ">=",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Lt => "<",
            Op::Eq => "==",
            Op::Ne => "!=",
        };
        f.write_str(s)
    }
}

impl FromStr for Op {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">=" => Ok(Op::Ge),
            "<=" => Ok(Op::Le),
            ">" => Ok(Op::Gt),
            "<" => Ok(Op::Lt),
            "==" => Ok(Op::Eq),
            "!=" => Ok(Op::Ne),
            _ => bail!(VersionParseError(s.to_owned())),
        }
    }
}

/// A relational constraint, e.g. the `>=1.2_1` half of `foo>=1.2_1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub op: Op,
    pub version: String,
}

impl Constraint {
    pub fn matches(&self, version: &str) -> bool {
        self.op.matches(cmpver(version, &self.version))
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op, self.version)
    }
}

/// The three pattern syntaxes a package pattern can take per the design's
/// §4.5: exact match, relational `name<op>ver`, or a glob matched with
/// POSIX fnmatch semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    Relational { name: String, constraint: Constraint },
    Glob { name: String, glob: String },
}

impl Pattern {
    /// Returns the plain package name this pattern targets, stripping any
    /// operator/version/glob suffix.
    pub fn name(&self) -> &str {
        match self {
            Pattern::Exact(pkgver) => pkg_name(pkgver),
            Pattern::Relational { name, .. } => name,
            Pattern::Glob { name, .. } => name,
        }
    }

    /// Does `pkgver` (`name-version[_rev]`) satisfy this pattern?
    pub fn matches(&self, pkgver: &str) -> bool {
        match self {
            Pattern::Exact(want) => want == pkgver,
            Pattern::Relational { name, constraint } => {
                pkg_name(pkgver) == name
                    && pkg_version(pkgver)
                        .map(|v| constraint.matches(v))
                        .unwrap_or(false)
            }
            Pattern::Glob { glob, .. } => fnmatch(glob, pkgver),
        }
    }
}

const OPS: [&str; 6] = [">=", "<=", "==", "!=", ">", "<"];

impl FromStr for Pattern {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((name, rest)) = OPS.iter().find_map(|op| s.split_once(op).map(|(n, v)| (n, (*op, v)))) {
            let (op, version) = rest;
            if name.is_empty() || version.is_empty() {
                bail!(VersionParseError(s.to_owned()));
            }
            return Ok(Pattern::Relational {
                name: name.to_owned(),
                constraint: Constraint {
                    op: op.parse()?,
                    version: version.to_owned(),
                },
            });
        }

        if s.contains(['*', '?', '[']) {
            let name = s
                .split(['*', '?', '['])
                .next()
                .unwrap_or(s)
                .trim_end_matches('-')
                .to_owned();
            return Ok(Pattern::Glob {
                name,
                glob: s.to_owned(),
            });
        }

        Ok(Pattern::Exact(s.to_owned()))
    }
}

/// `pkgver = pkgname-version[_rev]`. Splits at the last `-` before a
/// component that looks like a version (starts with a digit).
pub fn pkg_name(pkgver: &str) -> &str {
    pkgver
        .rmatch_indices('-')
        .find(|(i, _)| {
            pkgver[*i + 1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        })
        .map(|(i, _)| &pkgver[..i])
        .unwrap_or(pkgver)
}

pub fn pkg_version(pkgver: &str) -> Option<&str> {
    let name = pkg_name(pkgver);
    pkgver.strip_prefix(name)?.strip_prefix('-')
}

/// Minimal POSIX `fnmatch`-style glob: `*` (any run), `?` (one char), and
/// `[...]` character classes. No path-separator special-casing, since
/// pkgvers never contain `/`.
pub fn fnmatch(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            Some(b'?') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some(b'[') => {
                let close = match p.iter().position(|&b| b == b']') {
                    Some(i) if i > 0 => i,
                    _ => return p == t,
                };
                if t.is_empty() {
                    return false;
                }
                let (negate, class) = match p[1] {
                    b'!' | b'^' => (true, &p[2..close]),
                    _ => (false, &p[1..close]),
                };
                let hit = class.contains(&t[0]);
                if hit != negate {
                    inner(&p[close + 1..], &t[1..])
                } else {
                    false
                }
            }
            Some(&c) => !t.is_empty() && t[0] == c && inner(&p[1..], &t[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// `pattern_match(version, pattern)`, as a convenience wrapper over
/// [`Pattern`] for callers that already have a parsed pattern and only a bare
/// version (not a full `pkgver`) to test — used by `reverts` handling.
pub fn pattern_match_version(pattern: &Pattern, version: &str) -> bool {
    match pattern {
        Pattern::Exact(want) => want == version,
        Pattern::Relational { constraint, .. } => constraint.matches(version),
        Pattern::Glob { glob, .. } => fnmatch(glob, version),
    }
}

#[cfg(test)]
#[path = "version.test.rs"]
mod test;
