//! Resource requirement strings.
//!
//! A resource string is zero or more `/`-separated records, each of the form
//! `name<op>value[suffix]` where `op` is one of `<=`, `>=`, `<`, `>`, `=` and
//! the optional suffix `k`, `M`, `G` or `T` (any case) scales the value by a
//! power of 1024.
//!
//! Requirements are checked conjunctively. A resource the offer does not
//! advertise is treated as having the value `0`, so `MEM<4G` is satisfied by
//! an offer without `MEM` while `MEM>=4G` is not.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

use crate::error::{ConstraintError, ConstraintResult};

static RECORD: LazyLock<Regex> = LazyLock::new(|| {
    // Two-character operators come first in the alternation so `<=` is never
    // read as `<` followed by `=...`.
    Regex::new(r"^([A-Za-z0-9_]+)(<=|>=|<|>|=)([0-9]+)([kKmMgGtT]?)$")
        .expect("static resource record pattern")
});

/// Comparison operator of a resource requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Op {
    /// Evaluate `offered <op> required`.
    pub fn evaluate(self, offered: u64, required: u64) -> bool {
        match self {
            Op::Lt => offered < required,
            Op::Le => offered <= required,
            Op::Gt => offered > required,
            Op::Ge => offered >= required,
            Op::Eq => offered == required,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "=",
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "<" => Some(Op::Lt),
            "<=" => Some(Op::Le),
            ">" => Some(Op::Gt),
            ">=" => Some(Op::Ge),
            "=" => Some(Op::Eq),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed `name<op>value` record with its value normalized to a plain count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRequirement {
    pub name: String,
    pub op: Op,
    pub value: u64,
}

impl ResourceRequirement {
    /// Check this requirement against an offered value (`None` = not advertised).
    pub fn is_met_by(&self, offered: Option<u64>) -> bool {
        self.op.evaluate(offered.unwrap_or(0), self.value)
    }
}

impl FromStr for ResourceRequirement {
    type Err = ConstraintError;

    fn from_str(record: &str) -> ConstraintResult<Self> {
        let caps = RECORD
            .captures(record)
            .ok_or_else(|| ConstraintError::MalformedRecord {
                record: record.to_string(),
            })?;

        let op = Op::from_symbol(&caps[2]).ok_or_else(|| ConstraintError::MalformedRecord {
            record: record.to_string(),
        })?;
        let value = scale(&caps[3], &caps[4]).ok_or_else(|| ConstraintError::Overflow {
            record: record.to_string(),
            value: format!("{}{}", &caps[3], &caps[4]),
        })?;

        Ok(Self {
            name: caps[1].to_string(),
            op,
            value,
        })
    }
}

impl fmt::Display for ResourceRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, self.op, self.value)
    }
}

/// An ordered list of resource records, either offered or required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet(Vec<ResourceRequirement>);

impl ResourceSet {
    pub fn new(records: Vec<ResourceRequirement>) -> Self {
        Self(records)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRequirement> {
        self.0.iter()
    }

    /// The advertised value for `name`, if any. The first record wins.
    pub fn value_of(&self, name: &str) -> Option<u64> {
        self.0.iter().find(|r| r.name == name).map(|r| r.value)
    }

    /// True when every record of `required` holds against this (offered) set.
    ///
    /// The operator always comes from the requirement; offered records are
    /// plain values.
    pub fn satisfies(&self, required: &ResourceSet) -> bool {
        required.iter().all(|req| {
            let met = req.is_met_by(self.value_of(&req.name));
            if !met {
                trace!(
                    resource = %req.name,
                    required = %req,
                    offered = ?self.value_of(&req.name),
                    "resource requirement not met"
                );
            }
            met
        })
    }
}

impl FromStr for ResourceSet {
    type Err = ConstraintError;

    fn from_str(input: &str) -> ConstraintResult<Self> {
        parse_resources(input)
    }
}

impl fmt::Display for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, record) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{record}")?;
        }
        Ok(())
    }
}

/// Parse a requirement string. The empty string is the empty (always-true) set.
pub fn parse_resources(input: &str) -> ConstraintResult<ResourceSet> {
    let input = strip_quotes(input);
    if input.is_empty() {
        return Ok(ResourceSet::default());
    }

    let mut records = Vec::new();
    for record in input.split('/') {
        if record.is_empty() {
            return Err(ConstraintError::EmptyRecord {
                input: input.to_string(),
            });
        }
        records.push(record.parse()?);
    }
    Ok(ResourceSet(records))
}

/// Parse an offered resource string, which may only use `=`.
pub fn parse_offered_resources(input: &str) -> ConstraintResult<ResourceSet> {
    let set = parse_resources(input)?;
    if let Some(bad) = set.iter().find(|r| r.op != Op::Eq) {
        return Err(ConstraintError::OfferOperator {
            record: bad.to_string(),
        });
    }
    Ok(set)
}

/// Decide whether an offered resource string satisfies a required one.
pub fn match_resources(offered: &str, required: &str) -> ConstraintResult<bool> {
    let required = parse_resources(required)?;
    let offered = parse_offered_resources(offered)?;
    Ok(offered.satisfies(&required))
}

/// Normalize a value such as `512M` to its plain count.
pub fn normalize_value(value: &str) -> ConstraintResult<u64> {
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    let valid_suffix = suffix.is_empty() || (suffix.len() == 1 && multiplier(suffix).is_some());
    if digits.is_empty() || !valid_suffix {
        return Err(ConstraintError::MalformedRecord {
            record: value.to_string(),
        });
    }
    scale(digits, suffix).ok_or_else(|| ConstraintError::Overflow {
        record: value.to_string(),
        value: value.to_string(),
    })
}

fn multiplier(suffix: &str) -> Option<u64> {
    match suffix {
        "" => Some(1),
        "k" | "K" => Some(1 << 10),
        "m" | "M" => Some(1 << 20),
        "g" | "G" => Some(1 << 30),
        "t" | "T" => Some(1 << 40),
        _ => None,
    }
}

fn scale(digits: &str, suffix: &str) -> Option<u64> {
    let number: u64 = digits.parse().ok()?;
    number.checked_mul(multiplier(suffix)?)
}

fn strip_quotes(input: &str) -> &str {
    input.trim().trim_matches(|c| c == '\'' || c == '"')
}
