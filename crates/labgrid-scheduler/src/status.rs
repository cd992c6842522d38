//! Machine status model.
//!
//! The persisted raw status plus lease and pool fields collapse into a small
//! public status. A lease beats everything; an idle machine in a pool whose
//! name ends in `x` is quarantined and reported as broken.

use std::fmt;
use std::str::FromStr;

use labgrid_constraint::{ConstraintResult, OfferedFlags, parse_offered_flags};
use labgrid_state::{JobId, Machine, RawStatus, Site, non_blank, split_list};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Public machine status shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicStatus {
    Borrowed,
    Idle,
    Broken,
    Running,
    Offline,
}

impl PublicStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PublicStatus::Borrowed => "borrowed",
            PublicStatus::Idle => "idle",
            PublicStatus::Broken => "broken",
            PublicStatus::Running => "running",
            PublicStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PublicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            // "leased" is the older name for the same thing.
            "borrowed" | "leased" => Ok(PublicStatus::Borrowed),
            "idle" => Ok(PublicStatus::Idle),
            "broken" => Ok(PublicStatus::Broken),
            "running" => Ok(PublicStatus::Running),
            "offline" => Ok(PublicStatus::Offline),
            other => Err(SchedulerError::Validation(format!("unknown machine status {other:?}"))),
        }
    }
}

/// Map raw state to the public status. Precedence: lease, then raw status.
pub fn derive_public_status(raw: &RawStatus, lease_user: Option<&str>, pool: &str) -> PublicStatus {
    if non_blank(lease_user).is_some() {
        return PublicStatus::Borrowed;
    }
    match raw {
        RawStatus::Idle if pool.ends_with('x') => PublicStatus::Broken,
        RawStatus::Idle => PublicStatus::Idle,
        RawStatus::Running | RawStatus::Scheduled | RawStatus::Slaved => PublicStatus::Running,
        RawStatus::Other(_) => PublicStatus::Offline,
    }
}

/// Read-side view of a machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineStatus {
    pub name: String,
    pub site: String,
    pub cluster: String,
    pub pool: String,
    pub status: PublicStatus,
    pub raw_status: RawStatus,
    pub resources: Vec<String>,
    /// Machine flags followed by the site's flags.
    pub flags: Vec<String>,
    pub lease_user: Option<String>,
    pub lease_from: Option<u64>,
    pub lease_to: Option<u64>,
    pub lease_reason: Option<String>,
    pub lease_policy: Option<u32>,
    pub job_id: Option<JobId>,
    pub broken: bool,
    /// Idle, unborrowed and not quarantined: can be handed out.
    pub free: bool,
}

impl MachineStatus {
    pub fn new(machine: &Machine, site: Option<&Site>) -> Self {
        let mut flags = split_list(&machine.flags);
        if let Some(site) = site {
            flags.extend(site.flag_list());
        }
        let resources = machine
            .resources
            .split('/')
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            name: machine.name.clone(),
            site: machine.site.clone(),
            cluster: machine.cluster.clone(),
            pool: machine.pool.clone(),
            status: derive_public_status(&machine.status, machine.borrower(), &machine.pool),
            raw_status: machine.status.clone(),
            resources,
            flags,
            lease_user: machine.borrower().map(str::to_string),
            lease_from: machine.lease_from,
            lease_to: machine.lease_to,
            lease_reason: machine.lease_reason.clone(),
            lease_policy: machine.lease_policy,
            job_id: machine.job_id,
            broken: machine.is_broken(),
            free: machine.is_free(),
        }
    }
}

/// The flags a machine offers: its own followed by its site's.
pub fn offered_flags(machine: &Machine, site: Option<&Site>) -> ConstraintResult<OfferedFlags> {
    let mut flags = parse_offered_flags(&machine.flags)?;
    if let Some(site) = site {
        flags.extend(parse_offered_flags(&site.flags)?);
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table() {
        let idle = RawStatus::Idle;
        assert_eq!(derive_public_status(&idle, None, "default"), PublicStatus::Idle);
        assert_eq!(derive_public_status(&idle, None, "brokenx"), PublicStatus::Broken);
        assert_eq!(
            derive_public_status(&RawStatus::Running, None, "default"),
            PublicStatus::Running
        );
        assert_eq!(derive_public_status(&idle, Some("alice"), "default"), PublicStatus::Borrowed);
        assert_eq!(
            derive_public_status(&RawStatus::from("weird"), None, "default"),
            PublicStatus::Offline
        );
    }

    #[test]
    fn scheduled_and_slaved_count_as_running() {
        for raw in [RawStatus::Scheduled, RawStatus::Slaved] {
            assert_eq!(derive_public_status(&raw, None, "default"), PublicStatus::Running);
        }
    }

    #[test]
    fn lease_overrides_everything() {
        assert_eq!(
            derive_public_status(&RawStatus::Idle, Some("bob"), "brokenx"),
            PublicStatus::Borrowed
        );
        assert_eq!(
            derive_public_status(&RawStatus::from("offline"), Some("bob"), "default"),
            PublicStatus::Borrowed
        );
    }

    #[test]
    fn broken_pool_only_matters_when_idle() {
        assert_eq!(
            derive_public_status(&RawStatus::Running, None, "poolx"),
            PublicStatus::Running
        );
        assert_eq!(
            derive_public_status(&RawStatus::from("dead"), None, "poolx"),
            PublicStatus::Offline
        );
    }

    #[test]
    fn blank_lease_user_is_not_a_lease() {
        assert_eq!(derive_public_status(&RawStatus::Idle, Some(""), "default"), PublicStatus::Idle);
        assert_eq!(derive_public_status(&RawStatus::Idle, Some("  "), "default"), PublicStatus::Idle);
    }

    #[test]
    fn view_agrees_with_direct_derivation() {
        let mut machine = Machine::new("m1", "siteA", "c1", "default").unwrap();
        machine.lease_user = Some(String::new());
        machine.comment = Some("bob".into());
        let view = MachineStatus::new(&machine, None);
        assert_eq!(view.status, PublicStatus::Borrowed);
        assert_eq!(view.lease_user.as_deref(), Some("bob"));
        assert!(!view.free);

        machine.lease_user = Some("  ".into());
        machine.comment = None;
        let view = MachineStatus::new(&machine, None);
        let direct = derive_public_status(&machine.status, machine.lease_user.as_deref(), &machine.pool);
        assert_eq!(view.status, direct);
        assert_eq!(view.status, PublicStatus::Idle);
        assert!(view.free);
    }

    #[test]
    fn parse_filter_names() {
        assert_eq!("leased".parse::<PublicStatus>().unwrap(), PublicStatus::Borrowed);
        assert_eq!("broken".parse::<PublicStatus>().unwrap(), PublicStatus::Broken);
        assert!("asleep".parse::<PublicStatus>().is_err());
    }

    #[test]
    fn view_merges_site_flags_and_comment_lease() {
        let mut machine = Machine::new("m1", "siteA", "c1", "default")
            .unwrap()
            .with_flags("nfs")
            .unwrap()
            .with_resources("MEM=8G/CPUS=4")
            .unwrap();
        machine.comment = Some("carol".into());
        let site = Site::new("siteA").unwrap().with_flags("+lab").unwrap();

        let view = MachineStatus::new(&machine, Some(&site));
        assert_eq!(view.status, PublicStatus::Borrowed);
        assert_eq!(view.lease_user.as_deref(), Some("carol"));
        assert_eq!(view.flags, ["nfs", "+lab"]);
        assert_eq!(view.resources, ["MEM=8G", "CPUS=4"]);
        assert!(!view.broken);
        assert!(!view.free);

        let offered = offered_flags(&machine, Some(&site)).unwrap();
        assert!(offered.has("lab"));
        assert!(offered.has("nfs"));
    }
}
