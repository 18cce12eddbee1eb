//! Version and version-constraint handling across packaging ecosystems.
//!
//! Most ecosystems tangle deals with (crates.io, npm, `PyPI`, Ubuntu) express
//! versions that coerce cleanly into semver; versions that do not (odd distro
//! strings) are carried verbatim and compared as opaque strings. A
//! [`VersionSpec`] keeps its canonical string form so that parsing its
//! display output yields an equal spec.

use crate::error::{Error, Result};
use semver::VersionReq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A version of a package in some ecosystem.
///
/// The string form a version arrived with is preserved, so displaying a
/// parsed version always round-trips. Comparison, equality and hashing go
/// through the *canonical* view: strict or coerced semver where one exists
/// (`"1.2"` and `"v1.2.0"` order as `1.2.0`), the raw string otherwise.
#[derive(Debug, Clone)]
pub enum Version {
    /// A version with full semver semantics.
    Semver(semver::Version),
    /// A version string without strict semver form, kept verbatim.
    Raw(String),
}

impl Version {
    /// Parse a version string. Strings that are not strict semver are kept
    /// raw; only an empty input fails.
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(Error::VersionParse {
                input: input.to_string(),
            });
        }
        if let Ok(v) = semver::Version::parse(s) {
            return Ok(Self::Semver(v));
        }
        Ok(Self::Raw(s.to_string()))
    }

    /// An opaque version carried verbatim (used by ecosystems with
    /// non-semver version strings, such as Go module pseudo-versions).
    #[must_use]
    pub fn raw(input: impl Into<String>) -> Self {
        Self::Raw(input.into())
    }

    /// The semver view used for comparison and constraint matching:
    /// a leading `v` is stripped and partial numeric versions are padded
    /// (`"1.2"` becomes `1.2.0`).
    #[must_use]
    pub fn canonical(&self) -> Option<semver::Version> {
        match self {
            Self::Semver(v) => Some(v.clone()),
            Self::Raw(s) => Self::coerce(s),
        }
    }

    /// Pad a partial numeric version out to full semver.
    fn coerce(s: &str) -> Option<semver::Version> {
        let s = s.strip_prefix('v').unwrap_or(s);
        if let Ok(v) = semver::Version::parse(s) {
            return Some(v);
        }
        let head_len = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (head, rest) = s.split_at(head_len);
        let mut nums = head.split('.').filter(|p| !p.is_empty());
        let major: u64 = nums.next()?.parse().ok()?;
        let minor: u64 = nums.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch: u64 = nums.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        // any fourth-and-beyond numeric component moves into build metadata
        let extra: Vec<&str> = nums.collect();

        let mut version = semver::Version::new(major, minor, patch);
        if !extra.is_empty() {
            version.build = semver::BuildMetadata::new(&extra.join(".")).ok()?;
        }
        match rest.as_bytes().first() {
            None => {}
            Some(b'-') => version.pre = semver::Prerelease::new(&rest[1..]).ok()?,
            Some(b'+') => version.build = semver::BuildMetadata::new(&rest[1..]).ok()?,
            Some(_) => {
                version =
                    semver::Version::parse(&format!("{major}.{minor}.{patch}-{rest}")).ok()?;
            }
        }
        Some(version)
    }

    fn canonical_string(&self) -> String {
        self.canonical()
            .map_or_else(|| self.to_string(), |v| v.to_string())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Semver(v) => write!(f, "{v}"),
            Self::Raw(s) => write!(f, "{s}"),
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.canonical(), other.canonical()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_string().hash(state);
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s).unwrap_or(Self::Raw(s)))
    }
}

/// Which constraint grammar a [`VersionSpec`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpecSyntax {
    /// Operator-based constraints: `*`, `=1.2`, `>=7.4`, `^1.0`, `~2.3`,
    /// comma for AND, `||` for OR.
    Simple,
    /// Exact string match against the version (Go modules).
    Exact,
}

/// A constraint over [`Version`]s with a canonical string form.
///
/// Parsing the display form of any spec produced here yields an equal spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionSpec {
    raw: String,
    syntax: SpecSyntax,
}

impl VersionSpec {
    /// The universal wildcard.
    #[must_use]
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            syntax: SpecSyntax::Simple,
        }
    }

    /// A spec satisfied exactly by `version`.
    #[must_use]
    pub fn exact(version: &Version) -> Self {
        Self {
            raw: format!("={version}"),
            syntax: SpecSyntax::Simple,
        }
    }

    /// A Go-style spec: string equality against the version.
    #[must_use]
    pub fn exact_raw(version: impl Into<String>) -> Self {
        Self {
            raw: version.into(),
            syntax: SpecSyntax::Exact,
        }
    }

    /// Parse a simple-syntax constraint, canonicalizing whitespace.
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::any());
        }
        let mut parts = Vec::new();
        for part in s.split("||") {
            let mut blocks = Vec::new();
            for block in part.split(',') {
                let block: String = block.split_whitespace().collect();
                if !Self::valid_block(&block) {
                    return Err(Error::SpecParse {
                        input: input.to_string(),
                    });
                }
                blocks.push(block);
            }
            parts.push(blocks.join(","));
        }
        Ok(Self {
            raw: parts.join("||"),
            syntax: SpecSyntax::Simple,
        })
    }

    fn valid_block(block: &str) -> bool {
        if block == "*" {
            return true;
        }
        let rest = Self::split_operator(block).1;
        !rest.is_empty()
            && rest
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit() || c == 'v' || c == '*')
            && rest
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '*'))
    }

    fn split_operator(block: &str) -> (&str, &str) {
        for op in ["!=", ">=", "<=", "==", ">", "<", "^", "~", "="] {
            if let Some(rest) = block.strip_prefix(op) {
                return (op, rest);
            }
        }
        ("", block)
    }

    /// The canonical string form of this spec.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The grammar this spec was parsed with.
    #[must_use]
    pub const fn syntax(&self) -> SpecSyntax {
        self.syntax
    }

    /// True if this is the universal wildcard.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.raw == "*"
    }

    /// Check whether `version` satisfies this spec.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        match self.syntax {
            SpecSyntax::Exact => {
                let want = self.raw.strip_prefix('=').unwrap_or(&self.raw);
                let got = version.to_string();
                strip_v(want) == strip_v(&got)
            }
            SpecSyntax::Simple => self
                .raw
                .split("||")
                .any(|part| part.split(',').all(|block| Self::match_block(block, version))),
        }
    }

    fn match_block(block: &str, version: &Version) -> bool {
        if block == "*" || block.is_empty() {
            return true;
        }
        let (op, target) = Self::split_operator(block);
        if op == "!=" {
            return !Self::match_block(&format!("={target}"), version);
        }
        if let Some(v) = version.canonical() {
            let op = match op {
                "" | "==" => "=",
                other => other,
            };
            // npm-style `1.x` means the same as `1.*`
            let target_norm = strip_v(target).replace(".x", ".*").replace(".X", ".*");
            // `1.2.*` is already a complete comparator; don't prefix it
            let req = if target_norm.contains('*') {
                VersionReq::parse(&target_norm)
            } else {
                VersionReq::parse(&format!("{op}{target_norm}"))
            };
            if let Ok(req) = req {
                return req.matches(&v);
            }
        }
        // Non-semver versions only support (in)equality comparison.
        match op {
            "" | "=" | "==" => strip_v(target) == strip_v(&version.to_string()),
            _ => false,
        }
    }

    /// Union of two specs: satisfied by anything either side accepts.
    ///
    /// Falls back to the wildcard when the grammars cannot express a union.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        if self == other {
            return self.clone();
        }
        if self.is_any() || other.is_any() {
            return Self::any();
        }
        match (self.syntax, other.syntax) {
            (SpecSyntax::Simple, SpecSyntax::Simple) => Self {
                raw: format!("{}||{}", self.raw, other.raw),
                syntax: SpecSyntax::Simple,
            },
            _ => Self::any(),
        }
    }

    /// Conjunction of several specs (all must hold). Used when multiple
    /// requirements target the same package during SBOM resolution.
    #[must_use]
    pub fn conjunction<'a>(specs: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut blocks: Vec<String> = Vec::new();
        for spec in specs {
            if spec.is_any() {
                continue;
            }
            blocks.push(spec.raw.clone());
        }
        if blocks.is_empty() {
            return Self::any();
        }
        if blocks.len() == 1 {
            return Self {
                raw: blocks.pop().unwrap_or_default(),
                syntax: SpecSyntax::Simple,
            };
        }
        Self {
            raw: blocks.join(","),
            syntax: SpecSyntax::Simple,
        }
    }
}

fn strip_v(s: &str) -> &str {
    s.strip_prefix('v').unwrap_or(s)
}

impl Default for VersionSpec {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl std::ops::BitOr for VersionSpec {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(&rhs)
    }
}

impl FromStr for VersionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for VersionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for VersionSpec {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s).unwrap_or(Self {
            raw: s,
            syntax: SpecSyntax::Simple,
        }))
    }
}
