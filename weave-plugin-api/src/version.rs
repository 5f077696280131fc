//! Semantic versions, ranges and upgrade checks
//!
//! Parsing is strict: `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]` and nothing
//! else. Range matching supports the comparator, caret and tilde forms used in
//! manifest dependency declarations.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing versions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("Version is empty")]
    Empty,

    #[error("Invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidFormat(String),

    #[error("Invalid numeric component '{component}' in version '{version}'")]
    InvalidNumber { version: String, component: String },

    #[error("Invalid identifier '{identifier}' in version '{version}'")]
    InvalidIdentifier { version: String, identifier: String },
}

/// A parsed semantic version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl SemanticVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Compare by semver precedence (build metadata is ignored)
    pub fn cmp_precedence(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => compare_prerelease(a, b),
            })
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for SemanticVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_version(s)
    }
}

impl Serialize for SemanticVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemanticVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_version(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a strict semantic version string
pub fn parse_version(input: &str) -> Result<SemanticVersion, VersionError> {
    if input.is_empty() {
        return Err(VersionError::Empty);
    }

    let (rest, build) = match input.split_once('+') {
        Some((rest, build)) => (rest, Some(build)),
        None => (input, None),
    };
    let (core, prerelease) = match rest.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (rest, None),
    };

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3 {
        return Err(VersionError::InvalidFormat(input.to_string()));
    }

    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(VersionError::InvalidFormat(input.to_string()));
        }
        if part.len() > 1 && part.starts_with('0') {
            return Err(VersionError::InvalidNumber {
                version: input.to_string(),
                component: part.to_string(),
            });
        }
        *slot = part.parse().map_err(|_| VersionError::InvalidNumber {
            version: input.to_string(),
            component: part.to_string(),
        })?;
    }

    if let Some(prerelease) = prerelease {
        validate_identifiers(input, prerelease)?;
    }
    if let Some(build) = build {
        validate_build(input, build)?;
    }

    Ok(SemanticVersion {
        major: numbers[0],
        minor: numbers[1],
        patch: numbers[2],
        prerelease: prerelease.map(str::to_string),
        build: build.map(str::to_string),
    })
}

/// Prerelease identifiers: alphanumerics and hyphens, numeric ones without
/// leading zeros
fn validate_identifiers(version: &str, identifiers: &str) -> Result<(), VersionError> {
    for identifier in identifiers.split('.') {
        let numeric = identifier.bytes().all(|b| b.is_ascii_digit());
        if !is_identifier(identifier) || (numeric && identifier.len() > 1 && identifier.starts_with('0')) {
            return Err(VersionError::InvalidIdentifier {
                version: version.to_string(),
                identifier: identifier.to_string(),
            });
        }
    }
    Ok(())
}

/// Build metadata may keep leading zeros
fn validate_build(version: &str, identifiers: &str) -> Result<(), VersionError> {
    match identifiers.split('.').find(|identifier| !is_identifier(identifier)) {
        Some(identifier) => Err(VersionError::InvalidIdentifier {
            version: version.to_string(),
            identifier: identifier.to_string(),
        }),
        None => Ok(()),
    }
}

fn is_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');

    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Compare two version strings by semver precedence
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, VersionError> {
    Ok(parse_version(a)?.cmp_precedence(&parse_version(b)?))
}

// ============================================================================
// Ranges
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Exact,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    Caret,
    Tilde,
}

impl Operator {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "" | "=" | "==" => Some(Self::Exact),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterEq),
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessEq),
            "^" => Some(Self::Caret),
            "~" => Some(Self::Tilde),
            _ => None,
        }
    }
}

fn split_operator(constraint: &str) -> (&str, &str) {
    let idx = constraint
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
        .unwrap_or(constraint.len());
    constraint.split_at(idx)
}

fn satisfies_constraint(version: &SemanticVersion, op: Operator, target: &SemanticVersion) -> bool {
    let ord = version.cmp_precedence(target);
    match op {
        Operator::Exact => ord == Ordering::Equal,
        Operator::Greater => ord == Ordering::Greater,
        Operator::GreaterEq => ord != Ordering::Less,
        Operator::Less => ord == Ordering::Less,
        Operator::LessEq => ord != Ordering::Greater,
        Operator::Caret => {
            let same_line = if target.major > 0 {
                version.major == target.major
            } else if target.minor > 0 {
                version.major == 0 && version.minor == target.minor
            } else {
                version.major == 0 && version.minor == 0 && version.patch == target.patch
            };
            same_line && ord != Ordering::Less
        }
        Operator::Tilde => {
            version.major == target.major
                && version.minor == target.minor
                && ord != Ordering::Less
        }
    }
}

/// A prerelease only matches a set in which some comparator names a
/// prerelease of the same `major.minor.patch`; `^1.2.0` excludes `1.3.0-beta`
fn satisfies_all(version: &SemanticVersion, comparators: &str) -> bool {
    let mut tokens = comparators.split_whitespace().peekable();
    let mut matched_any = false;
    let mut saw_comparator = false;
    let mut admits_prerelease = false;

    while let Some(token) = tokens.next() {
        if token == "*" || token.eq_ignore_ascii_case("x") {
            matched_any = true;
            continue;
        }

        // Allow a detached operator, e.g. ">= 1.0.0"
        let owned;
        let constraint = if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            match tokens.next() {
                Some(next) => {
                    owned = format!("{}{}", token, next);
                    owned.as_str()
                }
                None => return false,
            }
        } else {
            token
        };

        let (op, target) = split_operator(constraint);
        let (Some(op), Ok(target)) = (Operator::parse(op), parse_version(target)) else {
            return false;
        };
        if !satisfies_constraint(version, op, &target) {
            return false;
        }
        matched_any = true;
        saw_comparator = true;
        admits_prerelease |= target.prerelease.is_some()
            && (target.major, target.minor, target.patch) == (version.major, version.minor, version.patch);
    }

    if version.prerelease.is_some() && saw_comparator && !admits_prerelease {
        return false;
    }
    matched_any
}

/// Check whether `version` satisfies `range`
///
/// Unparsable versions or ranges never match.
pub fn satisfies_range(version: &str, range: &str) -> bool {
    let Ok(version) = parse_version(version.trim()) else {
        return false;
    };

    let range = range.trim();
    if range.is_empty() || range == "*" {
        return true;
    }

    range
        .split("||")
        .any(|alternative| satisfies_all(&version, alternative))
}

/// Whether an installed version meets a required range
pub fn is_version_compatible(required: &str, installed: &str) -> bool {
    satisfies_range(installed, required)
}

// ============================================================================
// Bumping
// ============================================================================

/// Kind of version increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionBump {
    Major,
    Minor,
    Patch,
    /// Prerelease bump with an optional identifier (defaults to `alpha`)
    Prerelease(Option<String>),
}

/// Produce the next version for a bump kind
pub fn bump_version(version: &str, bump: VersionBump) -> Result<SemanticVersion, VersionError> {
    let v = parse_version(version)?;

    let next = match bump {
        VersionBump::Major => SemanticVersion::new(v.major + 1, 0, 0),
        VersionBump::Minor => SemanticVersion::new(v.major, v.minor + 1, 0),
        VersionBump::Patch => SemanticVersion::new(v.major, v.minor, v.patch + 1),
        VersionBump::Prerelease(id) => {
            let bumped = v.prerelease.as_deref().and_then(|pre| {
                let (head, last) = match pre.rsplit_once('.') {
                    Some((head, last)) => (Some(head), last),
                    None => (None, pre),
                };
                let n: u64 = last.parse().ok()?;
                Some(match head {
                    Some(head) => format!("{}.{}", head, n + 1),
                    None => (n + 1).to_string(),
                })
            });
            let prerelease = match bumped {
                Some(p) => p,
                None => format!("{}.0", id.as_deref().unwrap_or("alpha")),
            };
            validate_identifiers(version, &prerelease)?;
            SemanticVersion {
                prerelease: Some(prerelease),
                ..SemanticVersion::new(v.major, v.minor, v.patch)
            }
        }
    };

    Ok(next)
}

// ============================================================================
// Compatibility
// ============================================================================

/// Severity of a compatibility issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// What a compatibility issue is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    InvalidVersion,
    VersionNotNewer,
    BreakingChange,
    NewPermissions,
    AppVersion,
    MissingDependency,
    DependencyVersion,
    NodeConflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CompatibilityIssue {
    pub fn new(kind: IssueKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Outcome of a compatibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub compatible: bool,
    pub issues: Vec<CompatibilityIssue>,
}

impl CompatibilityResult {
    /// Build a result; compatible unless some issue is an error
    pub fn from_issues(issues: Vec<CompatibilityIssue>) -> Self {
        Self {
            compatible: !issues.iter().any(|i| i.severity == Severity::Error),
            issues,
        }
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    pub fn has_breaking_change(&self) -> bool {
        self.has_issue(IssueKind::BreakingChange)
    }
}

/// Check an upgrade from one version to another
pub fn check_upgrade_compatibility(from: &str, to: &str) -> CompatibilityResult {
    let mut issues = Vec::new();
    upgrade_issues(from, to, &mut issues);
    CompatibilityResult::from_issues(issues)
}

pub(crate) fn upgrade_issues(from: &str, to: &str, issues: &mut Vec<CompatibilityIssue>) {
    let (current, next) = match (parse_version(from), parse_version(to)) {
        (Ok(current), Ok(next)) => (current, next),
        (Err(e), _) | (_, Err(e)) => {
            issues.push(CompatibilityIssue::new(
                IssueKind::InvalidVersion,
                Severity::Error,
                e.to_string(),
            ));
            return;
        }
    };

    if next.cmp_precedence(&current) != Ordering::Greater {
        issues.push(
            CompatibilityIssue::new(
                IssueKind::VersionNotNewer,
                Severity::Warning,
                "New version is not greater than the current version",
            )
            .with_details(format!("{} -> {}", current, next)),
        );
    }

    if next.major > current.major {
        issues.push(
            CompatibilityIssue::new(
                IssueKind::BreakingChange,
                Severity::Warning,
                "Major version upgrade may contain breaking changes",
            )
            .with_details(format!("{} -> {}", current, next)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &str, b: &str) -> Ordering {
        compare_versions(a, b).unwrap()
    }

    #[test]
    fn test_parse_full_version() {
        let v = parse_version("1.2.3-beta.1+build.42").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 2, 3));
        assert_eq!(v.prerelease.as_deref(), Some("beta.1"));
        assert_eq!(v.build.as_deref(), Some("build.42"));
        assert_eq!(v.to_string(), "1.2.3-beta.1+build.42");
    }

    #[test]
    fn test_parse_rejects_loose_forms() {
        for input in ["", "1.2", "v1.2.3", "1.2.3.4", "1..3", "1.2.x", "1.2.3-", "1.2.3-a..b", " 1.2.3"] {
            assert!(parse_version(input).is_err(), "accepted {:?}", input);
        }
        assert_eq!(parse_version(""), Err(VersionError::Empty));
    }

    #[test]
    fn test_parse_rejects_leading_zeros() {
        for input in ["01.2.3", "1.02.3", "1.2.03", "00.0.0", "1.2.3-01", "1.2.3-alpha.007"] {
            assert!(parse_version(input).is_err(), "accepted {:?}", input);
        }
        assert!(matches!(
            parse_version("1.02.3"),
            Err(VersionError::InvalidNumber { ref component, .. }) if component == "02"
        ));

        // Zero itself, alphanumerics with a leading zero and build metadata are fine
        for input in ["0.0.0", "10.20.30", "1.2.3-0", "1.2.3-0a", "1.2.3-rc.0", "1.2.3+001"] {
            assert!(parse_version(input).is_ok(), "rejected {:?}", input);
        }
    }

    #[test]
    fn test_compare_numeric_not_lexical() {
        assert_eq!(cmp("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(cmp("2.0.0", "1.99.99"), Ordering::Greater);
        assert_eq!(cmp("1.0.0", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_prerelease_ordering() {
        assert_eq!(cmp("2.0.0-beta", "2.0.0"), Ordering::Less);
        assert_eq!(cmp("1.0.0-alpha", "1.0.0-alpha.1"), Ordering::Less);
        assert_eq!(cmp("1.0.0-alpha.2", "1.0.0-alpha.10"), Ordering::Less);
        assert_eq!(cmp("1.0.0-1", "1.0.0-alpha"), Ordering::Less);
        assert_eq!(cmp("1.0.0-beta", "1.0.0-alpha"), Ordering::Greater);
        assert_eq!(cmp("1.0.0+a", "1.0.0+b"), Ordering::Equal);
    }

    #[test]
    fn test_compare_is_total_order() {
        let versions = [
            "0.0.1", "0.1.0", "1.0.0-alpha", "1.0.0-alpha.1", "1.0.0-alpha.beta",
            "1.0.0-beta", "1.0.0-beta.2", "1.0.0-beta.11", "1.0.0-rc.1", "1.0.0", "1.2.0", "1.10.0",
        ];
        for (i, a) in versions.iter().enumerate() {
            for (j, b) in versions.iter().enumerate() {
                assert_eq!(cmp(a, b), i.cmp(&j), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_caret_ranges() {
        assert!(satisfies_range("1.4.2", "^1.2.0"));
        assert!(!satisfies_range("2.0.0", "^1.2.0"));
        assert!(!satisfies_range("1.1.9", "^1.2.0"));
        assert!(satisfies_range("0.2.5", "^0.2.1"));
        assert!(!satisfies_range("0.3.0", "^0.2.1"));
        assert!(satisfies_range("0.0.3", "^0.0.3"));
        assert!(!satisfies_range("0.0.4", "^0.0.3"));
    }

    #[test]
    fn test_ranges_exclude_prereleases() {
        assert!(!satisfies_range("1.3.0-beta", "^1.2.0"));
        assert!(!satisfies_range("1.2.5-rc.1", "~1.2.0"));
        assert!(!satisfies_range("1.5.0-alpha", ">=1.0.0 <2.0.0"));

        // Opted in by naming a prerelease of the same release
        assert!(satisfies_range("1.2.0-beta.3", "^1.2.0-beta.1"));
        assert!(satisfies_range("1.2.0", "^1.2.0-beta.1"));
        assert!(!satisfies_range("1.3.0-beta", "^1.2.0-beta.1"));
        assert!(satisfies_range("1.3.0-beta", "^1.2.0 || >=1.3.0-alpha"));

        assert!(satisfies_range("1.3.0-beta", "*"));
    }

    #[test]
    fn test_tilde_and_comparators() {
        assert!(satisfies_range("1.2.9", "~1.2.3"));
        assert!(!satisfies_range("1.3.0", "~1.2.3"));
        assert!(satisfies_range("1.5.0", ">=1.0.0 <2.0.0"));
        assert!(!satisfies_range("2.0.0", ">=1.0.0 <2.0.0"));
        assert!(satisfies_range("1.5.0", ">= 1.0.0"));
        assert!(satisfies_range("3.0.0", "^1.0.0 || ^3.0.0"));
        assert!(satisfies_range("1.0.0", "1.0.0"));
        assert!(satisfies_range("1.0.0", "*"));
    }

    #[test]
    fn test_invalid_range_never_matches() {
        assert!(!satisfies_range("1.0.0", "^banana"));
        assert!(!satisfies_range("not-a-version", "*"));
        assert!(!satisfies_range("1.0.0", "!1.0.0"));
        assert!(is_version_compatible("^1.0.0", "1.3.0"));
    }

    #[test]
    fn test_bump_version() {
        let bump = |v: &str, b| bump_version(v, b).unwrap().to_string();
        assert_eq!(bump("1.2.3", VersionBump::Major), "2.0.0");
        assert_eq!(bump("1.2.3", VersionBump::Minor), "1.3.0");
        assert_eq!(bump("1.2.3", VersionBump::Patch), "1.2.4");
        assert_eq!(bump("1.2.3", VersionBump::Prerelease(None)), "1.2.3-alpha.0");
        assert_eq!(bump("1.2.3-beta.4", VersionBump::Prerelease(None)), "1.2.3-beta.5");
        assert_eq!(
            bump("1.2.3-rc", VersionBump::Prerelease(Some("beta".into()))),
            "1.2.3-beta.0"
        );
    }

    #[test]
    fn test_major_upgrade_is_breaking() {
        let result = check_upgrade_compatibility("1.0.0", "2.0.0");
        assert!(result.compatible);
        assert!(result.has_breaking_change());

        let minor = check_upgrade_compatibility("1.0.0", "1.1.0");
        assert!(minor.issues.is_empty());
    }

    #[test]
    fn test_downgrade_and_invalid() {
        let down = check_upgrade_compatibility("1.2.0", "1.1.0");
        assert!(down.has_issue(IssueKind::VersionNotNewer));
        assert!(down.compatible);

        let invalid = check_upgrade_compatibility("1.0", "2.0.0");
        assert!(!invalid.compatible);
        assert!(invalid.has_issue(IssueKind::InvalidVersion));
    }
}
