//! Flag requirement strings.
//!
//! Offered flags are comma-separated tokens, optionally decorated:
//!
//! | Token | Meaning |
//! |---|---|
//! | `x` | the resource has flag `x` |
//! | `+x` | the resource has `x` and only serves requesters that ask for it |
//! | `-x` | `x` is explicitly disabled, overriding any plain `x` |
//!
//! Required flags use a different decoration set:
//!
//! | Token | Meaning |
//! |---|---|
//! | `x` | the resource must have `x` |
//! | `!x` | the resource must not have `x` |
//! | `~x` | acknowledges a mandatory `+x` without demanding it |

use std::fmt;
use std::str::FromStr;

use tracing::trace;

use crate::error::{ConstraintError, ConstraintResult};

/// How a required flag token constrains an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    Required,
    Forbidden,
    Soft,
}

/// One parsed required flag token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlagRequirement {
    pub name: String,
    pub kind: FlagKind,
}

impl FromStr for FlagRequirement {
    type Err = ConstraintError;

    fn from_str(token: &str) -> ConstraintResult<Self> {
        let (kind, name) = match token.as_bytes().first() {
            Some(b'!') => (FlagKind::Forbidden, &token[1..]),
            Some(b'~') => (FlagKind::Soft, &token[1..]),
            _ => (FlagKind::Required, token),
        };
        validate_name(token, name)?;
        Ok(Self {
            name: name.to_string(),
            kind,
        })
    }
}

impl fmt::Display for FlagRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FlagKind::Required => write!(f, "{}", self.name),
            FlagKind::Forbidden => write!(f, "!{}", self.name),
            FlagKind::Soft => write!(f, "~{}", self.name),
        }
    }
}

/// Decoration carried by an offered flag token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagDecoration {
    Plain,
    Mandatory,
    Negated,
}

/// One parsed offered flag token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfferedFlag {
    pub name: String,
    pub decoration: FlagDecoration,
}

impl FromStr for OfferedFlag {
    type Err = ConstraintError;

    fn from_str(token: &str) -> ConstraintResult<Self> {
        let (decoration, name) = match token.as_bytes().first() {
            Some(b'+') => (FlagDecoration::Mandatory, &token[1..]),
            Some(b'-') => (FlagDecoration::Negated, &token[1..]),
            _ => (FlagDecoration::Plain, token),
        };
        validate_name(token, name)?;
        Ok(Self {
            name: name.to_string(),
            decoration,
        })
    }
}

impl fmt::Display for OfferedFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decoration {
            FlagDecoration::Plain => write!(f, "{}", self.name),
            FlagDecoration::Mandatory => write!(f, "+{}", self.name),
            FlagDecoration::Negated => write!(f, "-{}", self.name),
        }
    }
}

/// A parsed list of required flag tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagRequirements(Vec<FlagRequirement>);

impl FlagRequirements {
    pub fn new(tokens: Vec<FlagRequirement>) -> Self {
        Self(tokens)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlagRequirement> {
        self.0.iter()
    }

    /// True if `name` is requested outright or soft-acknowledged.
    pub fn acknowledges(&self, name: &str) -> bool {
        self.0
            .iter()
            .any(|r| r.name == name && matches!(r.kind, FlagKind::Required | FlagKind::Soft))
    }
}

impl FromStr for FlagRequirements {
    type Err = ConstraintError;

    fn from_str(input: &str) -> ConstraintResult<Self> {
        parse_required_flags(input)
    }
}

impl fmt::Display for FlagRequirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.0)
    }
}

/// A parsed list of offered flag tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferedFlags(Vec<OfferedFlag>);

impl OfferedFlags {
    pub fn new(tokens: Vec<OfferedFlag>) -> Self {
        Self(tokens)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OfferedFlag> {
        self.0.iter()
    }

    /// Append another offer's tokens (e.g. site-wide flags onto a machine's).
    pub fn extend(&mut self, other: OfferedFlags) {
        self.0.extend(other.0);
    }

    /// True if `name` is offered as `x` or `+x`.
    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|f| {
            f.name == name
                && matches!(f.decoration, FlagDecoration::Plain | FlagDecoration::Mandatory)
        })
    }

    /// True if `-name` is offered.
    pub fn negates(&self, name: &str) -> bool {
        self.0
            .iter()
            .any(|f| f.name == name && f.decoration == FlagDecoration::Negated)
    }

    /// Names of the `+x` tokens.
    pub fn mandatory(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|f| f.decoration == FlagDecoration::Mandatory)
            .map(|f| f.name.as_str())
    }

    /// Check a requirement list against this offer.
    pub fn satisfies(&self, required: &FlagRequirements) -> bool {
        for req in required.iter() {
            let ok = match req.kind {
                FlagKind::Soft => true,
                FlagKind::Forbidden => !self.has(&req.name),
                FlagKind::Required => self.has(&req.name) && !self.negates(&req.name),
            };
            if !ok {
                trace!(flag = %req, "flag requirement not met");
                return false;
            }
        }

        if let Some(flag) = self.mandatory().find(|name| !required.acknowledges(name)) {
            trace!(flag, "mandatory flag not requested");
            return false;
        }
        true
    }
}

impl FromStr for OfferedFlags {
    type Err = ConstraintError;

    fn from_str(input: &str) -> ConstraintResult<Self> {
        parse_offered_flags(input)
    }
}

impl fmt::Display for OfferedFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.0)
    }
}

/// Parse a required flag list. The empty string is the empty list.
pub fn parse_required_flags(input: &str) -> ConstraintResult<FlagRequirements> {
    tokens(input)?
        .map(str::parse)
        .collect::<ConstraintResult<Vec<_>>>()
        .map(FlagRequirements)
}

/// Parse an offered flag list. The empty string is the empty list.
pub fn parse_offered_flags(input: &str) -> ConstraintResult<OfferedFlags> {
    tokens(input)?
        .map(str::parse)
        .collect::<ConstraintResult<Vec<_>>>()
        .map(OfferedFlags)
}

/// Decide whether an offered flag string satisfies a required one.
pub fn match_flags(offered: &str, required: &str) -> ConstraintResult<bool> {
    let required = parse_required_flags(required)?;
    let offered = parse_offered_flags(offered)?;
    Ok(offered.satisfies(&required))
}

fn tokens(input: &str) -> ConstraintResult<impl Iterator<Item = &str>> {
    let input = input.trim();
    let parts: Vec<&str> = if input.is_empty() {
        Vec::new()
    } else {
        input.split(',').map(str::trim).collect()
    };
    if parts.iter().any(|t| t.is_empty()) {
        return Err(ConstraintError::EmptyFlag {
            input: input.to_string(),
        });
    }
    Ok(parts.into_iter())
}

fn validate_name(token: &str, name: &str) -> ConstraintResult<()> {
    let starts_decorated = name.starts_with(['+', '-', '!', '~']);
    if name.is_empty() || starts_decorated || name.contains(char::is_whitespace) {
        return Err(ConstraintError::InvalidFlag {
            flag: token.to_string(),
        });
    }
    Ok(())
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandatory_flag_needs_acknowledgement() {
        assert!(!match_flags("+lab", "").unwrap());
        assert!(match_flags("+lab", "lab").unwrap());
        assert!(match_flags("+lab", "~lab").unwrap());
        assert!(!match_flags("+lab,nfs", "nfs").unwrap());
    }

    #[test]
    fn forbidden_flag_short_circuits() {
        assert!(!match_flags("e1000,nfs", "!e1000").unwrap());
        assert!(!match_flags("+e1000,nfs", "nfs,e1000,!e1000").unwrap());
        assert!(!match_flags("nfs,e1000", "nfs,~lab,!e1000").unwrap());
        assert!(match_flags("nfs", "!e1000").unwrap());
    }

    #[test]
    fn negated_offer_overrides_membership() {
        assert!(!match_flags("nfs,-nfs", "nfs").unwrap());
        assert!(!match_flags("-nfs", "nfs").unwrap());
        // `-x` is an absence, so forbidding it passes.
        assert!(match_flags("-nfs", "!nfs").unwrap());
    }

    #[test]
    fn required_flag_must_be_present() {
        assert!(match_flags("nfs,iscsi", "iscsi").unwrap());
        assert!(!match_flags("nfs", "iscsi").unwrap());
        assert!(!match_flags("", "iscsi").unwrap());
    }

    #[test]
    fn soft_flag_demands_nothing() {
        assert!(match_flags("", "~lab").unwrap());
        assert!(match_flags("nfs", "~lab,~other").unwrap());
    }

    #[test]
    fn empty_sets() {
        assert!(match_flags("", "").unwrap());
        assert!(match_flags("nfs,-x", "").unwrap());
    }

    #[test]
    fn whitespace_around_tokens_is_ignored() {
        assert!(match_flags(" nfs , +lab ", "lab, nfs").unwrap());
    }

    #[test]
    fn malformed_flags_are_rejected() {
        assert!(parse_required_flags("a,,b").is_err());
        assert!(parse_required_flags("a,").is_err());
        assert!(parse_required_flags("!").is_err());
        assert!(parse_required_flags("!~a").is_err());
        assert!(parse_offered_flags("+").is_err());
        assert!(parse_offered_flags("+-a").is_err());
        assert!(parse_offered_flags("a b").is_err());
    }

    #[test]
    fn display_round_trips_decorations() {
        let offered = parse_offered_flags("+lab,-nfs,iscsi").unwrap();
        assert_eq!(offered.to_string(), "+lab,-nfs,iscsi");
        let required = parse_required_flags("!lab,~nfs,iscsi").unwrap();
        assert_eq!(required.to_string(), "!lab,~nfs,iscsi");
    }
}
