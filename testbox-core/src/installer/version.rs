//! Version and specifier parsing
//!
//! A practical subset of Python packaging versions: dotted numeric release,
//! optional `a`/`b`/`rc` pre-release, `.postN` and `.devN`.  Specifiers
//! support `== != >= <= > < ~= ===` plus `==X.Y.*` / `!=X.Y.*` wildcards;
//! comma-separated clauses are AND-ed.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Canonical package name: lowercase, `_` and `.` folded to `-`.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace(['_', '.'], "-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
}

/// A parsed package version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    release: Vec<u64>,
    pre: Option<(PreRelease, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
}

/// Leading decimal digits of `s` and the remainder.
fn leading_number(s: &str) -> Option<(u64, &str)> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    Some((s[..digits].parse().ok()?, &s[digits..]))
}

/// Consume an optional separator, `label` and number from the front of
/// `rest`.  A missing number counts as 0.
fn take_suffix<'a>(rest: &mut &'a str, label: &str) -> Option<u64> {
    let current: &'a str = *rest;
    let unseparated = current.strip_prefix(['.', '-', '_']).unwrap_or(current);
    let tail = unseparated.strip_prefix(label)?;
    let (n, tail) = leading_number(tail).unwrap_or((0, tail));
    *rest = tail;
    Some(n)
}

impl Version {
    pub fn new(release: impl Into<Vec<u64>>) -> Self {
        Self {
            release: release.into(),
            pre: None,
            post: None,
            dev: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid version '{input}'"));
        let lowered = input.trim().to_ascii_lowercase();
        let trimmed = lowered.strip_prefix('v').unwrap_or(&lowered);
        // Local labels (`+cpu`) do not take part in ordering.
        let mut rest = trimmed.split('+').next().unwrap_or_default();

        let mut release = Vec::new();
        loop {
            let (n, tail) = leading_number(rest).ok_or_else(invalid)?;
            release.push(n);
            match tail.strip_prefix('.') {
                Some(next) if next.starts_with(|c: char| c.is_ascii_digit()) => rest = next,
                _ => {
                    rest = tail;
                    break;
                }
            }
        }

        let pre = [
            ("rc", PreRelease::Rc),
            ("a", PreRelease::Alpha),
            ("b", PreRelease::Beta),
        ]
        .into_iter()
        .find_map(|(label, kind)| take_suffix(&mut rest, label).map(|n| (kind, n)));
        let post = take_suffix(&mut rest, "post");
        let dev = take_suffix(&mut rest, "dev");

        if !rest.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            release,
            pre,
            post,
            dev,
        })
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    fn release_at(&self, i: usize) -> u64 {
        self.release.get(i).copied().unwrap_or(0)
    }

    /// Release without trailing zeros, so `1.5 == 1.5.0`.
    fn trimmed_release(&self) -> &[u64] {
        let end = self
            .release
            .iter()
            .rposition(|&n| n != 0)
            .map_or(0, |i| i + 1);
        &self.release[..end]
    }

    fn sort_key(&self) -> (u8, Option<(PreRelease, u64)>, Option<u64>, (bool, u64)) {
        // `1.0.dev1` sorts before `1.0a1`, which sorts before `1.0`.
        let phase = match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => 0,
            (Some(_), _, _) => 1,
            _ => 2,
        };
        (
            phase,
            self.pre,
            self.post,
            (self.dev.is_none(), self.dev.unwrap_or(0)),
        )
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for i in 0..len {
            match self.release_at(i).cmp(&other.release_at(i)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.trimmed_release().hash(state);
        self.sort_key().hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let release: Vec<String> = self.release.iter().map(u64::to_string).collect();
        write!(f, "{}", release.join("."))?;
        if let Some((kind, n)) = self.pre {
            let label = match kind {
                PreRelease::Alpha => "a",
                PreRelease::Beta => "b",
                PreRelease::Rc => "rc",
            };
            write!(f, "{label}{n}")?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{n}")?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{n}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
    Compatible,
    Arbitrary,
}

impl Operator {
    fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::GreaterEqual => ">=",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::Less => "<",
            Self::Compatible => "~=",
            Self::Arbitrary => "===",
        }
    }
}

/// One `op version` clause of a specifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Clause {
    pub op: Operator,
    /// Text after the operator, as written (without `.*`)
    pub text: String,
    pub version: Option<Version>,
    /// `==1.2.*` style prefix match
    pub wildcard: bool,
}

impl Clause {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        // Longest operators first so `===` is not read as `==`.
        let (op, rest) = [
            ("===", Operator::Arbitrary),
            ("~=", Operator::Compatible),
            ("==", Operator::Equal),
            ("!=", Operator::NotEqual),
            (">=", Operator::GreaterEqual),
            ("<=", Operator::LessEqual),
            (">", Operator::Greater),
            ("<", Operator::Less),
        ]
        .into_iter()
        .find_map(|(text, op)| raw.strip_prefix(text).map(|rest| (op, rest.trim())))
        .ok_or_else(|| Error::InvalidInput(format!("specifier clause '{raw}' has no operator")))?;

        if rest.is_empty() {
            return Err(Error::InvalidInput(format!("specifier clause '{raw}' has no version")));
        }
        if op == Operator::Arbitrary {
            return Ok(Self {
                op,
                text: rest.to_string(),
                version: Version::parse(rest).ok(),
                wildcard: false,
            });
        }

        let (text, wildcard) = match rest.strip_suffix(".*") {
            Some(prefix) => {
                if !matches!(op, Operator::Equal | Operator::NotEqual) {
                    return Err(Error::InvalidInput(format!(
                        "wildcard only allowed with == or != in '{raw}'"
                    )));
                }
                (prefix, true)
            }
            None => (rest, false),
        };
        let version = Version::parse(text)?;
        if op == Operator::Compatible && version.release.len() < 2 {
            return Err(Error::InvalidInput(format!(
                "'~=' needs at least two release components in '{raw}'"
            )));
        }
        Ok(Self {
            op,
            text: text.to_string(),
            version: Some(version),
            wildcard,
        })
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        let Some(v) = &self.version else {
            return self.op == Operator::Arbitrary && candidate.to_string() == self.text;
        };
        match self.op {
            Operator::Equal if self.wildcard => prefix_matches(&v.release, candidate),
            Operator::NotEqual if self.wildcard => !prefix_matches(&v.release, candidate),
            Operator::Equal => candidate == v,
            Operator::NotEqual => candidate != v,
            Operator::GreaterEqual => candidate >= v,
            Operator::LessEqual => candidate <= v,
            Operator::Greater => candidate > v,
            Operator::Less => candidate < v,
            Operator::Compatible => {
                candidate >= v && prefix_matches(&v.release[..v.release.len() - 1], candidate)
            }
            Operator::Arbitrary => candidate.to_string() == self.text || candidate == v,
        }
    }
}

fn prefix_matches(prefix: &[u64], candidate: &Version) -> bool {
    prefix
        .iter()
        .enumerate()
        .all(|(i, &n)| candidate.release_at(i) == n)
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.text)?;
        if self.wildcard {
            write!(f, ".*")?;
        }
        Ok(())
    }
}

/// An AND of clauses; empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionSpec {
    clauses: Vec<Clause>,
}

impl VersionSpec {
    pub fn any() -> Self {
        Self::default()
    }


    pub fn parse(input: &str) -> Result<Self> {
        let clauses = input
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(Clause::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { clauses })
    }

    pub fn is_any(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.clauses.iter().all(|c| c.matches(version))
    }

    /// Conjunction of both specs, duplicate clauses dropped.
    pub fn intersect(&self, other: &VersionSpec) -> VersionSpec {
        let mut clauses = self.clauses.clone();
        for clause in &other.clauses {
            if !clauses.contains(clause) {
                clauses.push(clause.clone());
            }
        }
        VersionSpec { clauses }
    }

    /// Newest version in `available` matching this spec.  Pre-releases are
    /// only chosen when no final release matches.
    pub fn best_match<'a>(&self, available: impl IntoIterator<Item = &'a Version>) -> Option<Version> {
        let mut matching: Vec<&Version> = available.into_iter().filter(|v| self.matches(v)).collect();
        matching.sort();
        matching
            .iter()
            .rev()
            .find(|v| !v.is_prerelease())
            .or_else(|| matching.last())
            .map(|v| (*v).clone())
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.clauses.iter().map(Clause::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for VersionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionSpec {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<VersionSpec> for String {
    fn from(spec: VersionSpec) -> Self {
        spec.to_string()
    }
}

/// `name[extras] specifier ; marker`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Requirement {
    /// Normalized name
    pub name: String,
    pub extras: BTreeSet<String>,
    pub spec: VersionSpec,
    /// Environment marker, kept verbatim and not evaluated
    pub marker: Option<String>,
}

impl Requirement {
    pub fn new(name: &str, spec: VersionSpec) -> Self {
        Self {
            name: normalize_name(name),
            extras: BTreeSet::new(),
            spec,
            marker: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let (body, marker) = match input.split_once(';') {
            Some((body, marker)) => (body.trim(), Some(marker.trim().to_string())),
            None => (input.trim(), None),
        };

        let name_len = body
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(body.len());
        let name = &body[..name_len];
        if name.is_empty() {
            return Err(Error::InvalidInput(format!("requirement '{input}' has no package name")));
        }

        let mut rest = body[name_len..].trim_start();
        let mut extras = BTreeSet::new();
        if let Some(after) = rest.strip_prefix('[') {
            let (inner, tail) = after
                .split_once(']')
                .ok_or_else(|| Error::InvalidInput(format!("unclosed extras in '{input}'")))?;
            extras = inner
                .split(',')
                .map(normalize_name)
                .filter(|e| !e.is_empty())
                .collect();
            rest = tail.trim_start();
        }

        // Metadata sometimes wraps the specifier in parentheses.
        let spec_text = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .unwrap_or(rest);
        Ok(Self {
            name: normalize_name(name),
            extras,
            spec: VersionSpec::parse(spec_text)?,
            marker: marker.filter(|m| !m.is_empty()),
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            let extras: Vec<&str> = self.extras.iter().map(String::as_str).collect();
            write!(f, "[{}]", extras.join(","))?;
        }
        write!(f, "{}", self.spec)?;
        if let Some(marker) = &self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}

impl FromStr for Requirement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Requirement {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Requirement> for String {
    fn from(r: Requirement) -> Self {
        r.to_string()
    }
}
