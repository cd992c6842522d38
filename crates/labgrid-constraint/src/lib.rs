//! labgrid-constraint — the requirement language used to match jobs to
//! test machines and pooled resources.
//!
//! Two independent languages are supported:
//!
//! - **Resources**: `/`-separated records of the form `name<op>value[suffix]`,
//!   e.g. `MEM>=2G/CPUS>=4`. Offered sets use the same grammar with `=` only.
//! - **Flags**: comma-separated tokens. Offers may decorate tokens with `+`
//!   (mandatory) or `-` (explicitly disabled); requirements may use `!`
//!   (forbid) or `~` (soft acknowledgement of a mandatory flag).
//!
//! Strings are parsed once into typed values; malformed input is reported as
//! a [`ConstraintError`] rather than skipped. Matching is strictly boolean.
//!
//! ```
//! use labgrid_constraint::{match_flags, match_resources};
//!
//! assert!(match_resources("MEM=4G/CPUS=8", "MEM>=2G").unwrap());
//! assert!(!match_flags("+lab,nfs", "nfs").unwrap());
//! assert!(match_flags("+lab,nfs", "nfs,~lab").unwrap());
//! ```

pub mod error;
pub mod flags;
pub mod resources;

pub use error::{ConstraintError, ConstraintResult};
pub use flags::{
    FlagDecoration, FlagKind, FlagRequirement, FlagRequirements, OfferedFlag, OfferedFlags,
    match_flags, parse_offered_flags, parse_required_flags,
};
pub use resources::{
    Op, ResourceRequirement, ResourceSet, match_resources, normalize_value,
    parse_offered_resources, parse_resources,
};

/// A resource requirement and a flag requirement parsed together.
///
/// This is the shape a job hands to the scheduler: both halves must pass for
/// an offer to be eligible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    pub resources: ResourceSet,
    pub flags: FlagRequirements,
}

impl Constraints {
    /// Parse optional requirement strings. `None` behaves like the empty string.
    pub fn parse(resources: Option<&str>, flags: Option<&str>) -> ConstraintResult<Self> {
        Ok(Self {
            resources: parse_resources(resources.unwrap_or(""))?,
            flags: parse_required_flags(flags.unwrap_or(""))?,
        })
    }

    /// True when neither half constrains anything.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.flags.is_empty()
    }

    /// Check an already-parsed offer against both halves.
    pub fn admits(&self, resources: &ResourceSet, flags: &OfferedFlags) -> bool {
        resources.satisfies(&self.resources) && flags.satisfies(&self.flags)
    }

    /// Parse an offer in its stored string form and check it.
    pub fn admits_str(&self, resources: &str, flags: &str) -> ConstraintResult<bool> {
        let offered_resources = parse_offered_resources(resources)?;
        let offered_flags = parse_offered_flags(flags)?;
        Ok(self.admits(&offered_resources, &offered_flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraints_require_both_halves() {
        let c = Constraints::parse(Some("MEM>=2G"), Some("nfs")).unwrap();
        assert!(c.admits_str("MEM=4G", "nfs").unwrap());
        assert!(!c.admits_str("MEM=1G", "nfs").unwrap());
        assert!(!c.admits_str("MEM=4G", "iscsi").unwrap());
    }

    #[test]
    fn empty_constraints_still_honour_mandatory_flags() {
        let c = Constraints::parse(None, None).unwrap();
        assert!(c.is_empty());
        assert!(c.admits_str("MEM=4G", "nfs").unwrap());
        assert!(!c.admits_str("MEM=4G", "+lab").unwrap());
    }

    #[test]
    fn malformed_offer_is_an_error() {
        let c = Constraints::default();
        assert!(c.admits_str("MEM>=4G", "").is_err());
        assert!(c.admits_str("MEM", "").is_err());
    }
}
