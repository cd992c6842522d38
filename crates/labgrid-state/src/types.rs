//! Record types for the labgrid state store.
//!
//! Constructors and [`validate`](Machine::validate) methods enforce the
//! invariants each record must hold before it is written: names are
//! non-empty, stored resource and flag strings parse, shared-resource counts
//! are non-negative and a global resource carries a job exactly when it is
//! locked.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use labgrid_constraint::{parse_offered_flags, parse_offered_resources};
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Externally issued job identifier.
pub type JobId = u64;

fn require_name(kind: &str, name: &str) -> StateResult<()> {
    if name.trim().is_empty() {
        return Err(StateError::Invalid(format!("{kind} name must not be empty")));
    }
    Ok(())
}

/// `None` for absent, empty or whitespace-only values.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

fn check_resources(owner: &str, resources: &str) -> StateResult<()> {
    parse_offered_resources(resources)
        .map(|_| ())
        .map_err(|e| StateError::Invalid(format!("{owner}: {e}")))
}

fn check_flags(owner: &str, flags: &str) -> StateResult<()> {
    parse_offered_flags(flags)
        .map(|_| ())
        .map_err(|e| StateError::Invalid(format!("{owner}: {e}")))
}

// ── Machine ───────────────────────────────────────────────────────

/// Persisted machine state as written by the job runner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RawStatus {
    Idle,
    Scheduled,
    Running,
    Slaved,
    /// Anything else (e.g. "offline", "dead"), kept verbatim.
    Other(String),
}

impl RawStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RawStatus::Idle => "idle",
            RawStatus::Scheduled => "scheduled",
            RawStatus::Running => "running",
            RawStatus::Slaved => "slaved",
            RawStatus::Other(s) => s,
        }
    }
}

impl From<&str> for RawStatus {
    fn from(s: &str) -> Self {
        match s {
            "idle" => RawStatus::Idle,
            "scheduled" => RawStatus::Scheduled,
            "running" => RawStatus::Running,
            "slaved" => RawStatus::Slaved,
            other => RawStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for RawStatus {
    fn from(s: String) -> Self {
        RawStatus::from(s.as_str())
    }
}

impl From<RawStatus> for String {
    fn from(status: RawStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical or virtual test machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub name: String,
    pub site: String,
    pub cluster: String,
    /// Pool name. A trailing `x` marks the pool as quarantined.
    pub pool: String,
    pub status: RawStatus,
    /// Offered resources, e.g. `MEM=64G/CPUS=16`.
    #[serde(default)]
    pub resources: String,
    /// Offered flags, e.g. `+perf,nfs,-e1000`.
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub lease_user: Option<String>,
    /// Unix timestamp (seconds) the lease started.
    #[serde(default)]
    pub lease_from: Option<u64>,
    /// Unix timestamp (seconds) the lease expires.
    #[serde(default)]
    pub lease_to: Option<u64>,
    #[serde(default)]
    pub lease_reason: Option<String>,
    #[serde(default)]
    pub lease_policy: Option<u32>,
    /// Free text; a non-empty comment marks the machine as borrowed.
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub job_id: Option<JobId>,
}

impl Machine {
    /// A new idle machine with no resources, flags or lease.
    pub fn new(name: &str, site: &str, cluster: &str, pool: &str) -> StateResult<Self> {
        require_name("machine", name)?;
        require_name("site", site)?;
        Ok(Self {
            name: name.to_string(),
            site: site.to_string(),
            cluster: cluster.to_string(),
            pool: pool.to_string(),
            status: RawStatus::Idle,
            resources: String::new(),
            flags: String::new(),
            lease_user: None,
            lease_from: None,
            lease_to: None,
            lease_reason: None,
            lease_policy: None,
            comment: None,
            job_id: None,
        })
    }

    pub fn with_status(mut self, status: RawStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the offered resource string; it must parse with `=` records only.
    pub fn with_resources(mut self, resources: &str) -> StateResult<Self> {
        check_resources(&self.name, resources)?;
        self.resources = resources.to_string();
        Ok(self)
    }

    /// Set the offered flag string.
    pub fn with_flags(mut self, flags: &str) -> StateResult<Self> {
        check_flags(&self.name, flags)?;
        self.flags = flags.to_string();
        Ok(self)
    }

    pub fn with_lease(mut self, user: &str, from: u64, to: u64, reason: Option<&str>) -> Self {
        self.lease_user = Some(user.to_string());
        self.lease_from = Some(from);
        self.lease_to = Some(to);
        self.lease_reason = reason.map(str::to_string);
        self
    }

    /// Who currently holds the machine, from the lease or the comment marker.
    pub fn borrower(&self) -> Option<&str> {
        non_blank(self.lease_user.as_deref()).or_else(|| non_blank(self.comment.as_deref()))
    }

    /// True for the `_<site>` placeholder a site keeps for host-less jobs.
    pub fn is_pseudo_host(&self) -> bool {
        self.name.strip_prefix('_') == Some(self.site.as_str())
    }

    /// True when the pool is quarantined.
    pub fn is_broken(&self) -> bool {
        self.pool.ends_with('x')
    }

    /// True when the machine can be handed out: idle, unborrowed and not quarantined.
    pub fn is_free(&self) -> bool {
        self.status == RawStatus::Idle && self.borrower().is_none() && !self.is_broken()
    }

    pub fn validate(&self) -> StateResult<()> {
        require_name("machine", &self.name)?;
        require_name("site", &self.site)?;
        check_resources(&self.name, &self.resources)?;
        check_flags(&self.name, &self.flags)
    }
}

// ── Site ──────────────────────────────────────────────────────────

/// Site-scoped shared resource counts, stored as `name=value/name=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SharedResources(BTreeMap<String, u32>);

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.0.get(name).copied()
    }

    pub fn set(&mut self, name: &str, count: u32) {
        self.0.insert(name.to_string(), count);
    }

    /// Remove a key entirely. Returns the previous count.
    pub fn remove(&mut self, name: &str) -> Option<u32> {
        self.0.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromStr for SharedResources {
    type Err = StateError;

    fn from_str(input: &str) -> StateResult<Self> {
        let mut map = BTreeMap::new();
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self(map));
        }
        for record in input.split('/') {
            let (name, value) = record.split_once('=').ok_or_else(|| {
                StateError::Invalid(format!("shared resource {record:?} is not name=value"))
            })?;
            if name.is_empty() {
                return Err(StateError::Invalid(format!(
                    "shared resource {record:?} has no name"
                )));
            }
            let count: u32 = value.parse().map_err(|_| {
                StateError::Invalid(format!(
                    "shared resource {name:?} count {value:?} is not a non-negative integer"
                ))
            })?;
            map.insert(name.to_string(), count);
        }
        Ok(Self(map))
    }
}

impl TryFrom<String> for SharedResources {
    type Error = StateError;

    fn try_from(s: String) -> StateResult<Self> {
        s.parse()
    }
}

impl From<SharedResources> for String {
    fn from(res: SharedResources) -> Self {
        res.to_string()
    }
}

impl From<BTreeMap<String, u32>> for SharedResources {
    fn from(map: BTreeMap<String, u32>) -> Self {
        Self(map)
    }
}

impl fmt::Display for SharedResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, count)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{name}={count}")?;
        }
        Ok(())
    }
}

/// A lab site: a group of machines behind one controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub name: String,
    pub status: String,
    /// Site-wide offered flags, appended to every machine's flags.
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub ctrladdr: Option<String>,
    #[serde(default)]
    pub maxjobs: Option<u32>,
    #[serde(default)]
    pub shared_resources: SharedResources,
}

impl Site {
    pub fn new(name: &str) -> StateResult<Self> {
        require_name("site", name)?;
        Ok(Self {
            name: name.to_string(),
            status: "active".to_string(),
            flags: String::new(),
            description: None,
            location: None,
            ctrladdr: None,
            maxjobs: None,
            shared_resources: SharedResources::new(),
        })
    }

    pub fn with_flags(mut self, flags: &str) -> StateResult<Self> {
        check_flags(&self.name, flags)?;
        self.flags = flags.to_string();
        Ok(self)
    }

    pub fn flag_list(&self) -> Vec<String> {
        split_list(&self.flags)
    }

    pub fn validate(&self) -> StateResult<()> {
        require_name("site", &self.name)?;
        check_flags(&self.name, &self.flags)
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Global resource ───────────────────────────────────────────────

/// Lock state of a global resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Idle,
    Locked,
}

/// A pooled, non-machine resource such as a storage LUN or licence slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalResource {
    pub name: String,
    /// Category used for matching, e.g. `iscsi-lun`.
    #[serde(rename = "type")]
    pub restype: String,
    /// Sites this resource may be used from; `None` means any site.
    #[serde(default)]
    pub site: Option<Vec<String>>,
    pub status: ResourceStatus,
    #[serde(default)]
    pub job_id: Option<JobId>,
    /// Opaque payload handed to the claimant.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Offered resources, matched against optional claim constraints.
    #[serde(default)]
    pub resources: String,
    /// Offered flags, matched against optional claim constraints.
    #[serde(default)]
    pub flags: String,
}

impl GlobalResource {
    /// A new idle resource usable from any site.
    pub fn new(name: &str, restype: &str, data: serde_json::Value) -> StateResult<Self> {
        require_name("resource", name)?;
        if restype.trim().is_empty() {
            return Err(StateError::Invalid(format!("resource {name} has no type")));
        }
        Ok(Self {
            name: name.to_string(),
            restype: restype.to_string(),
            site: None,
            status: ResourceStatus::Idle,
            job_id: None,
            data,
            resources: String::new(),
            flags: String::new(),
        })
    }

    /// Restrict the resource to the given sites.
    pub fn with_sites(mut self, sites: &[&str]) -> Self {
        self.site = Some(sites.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_resources(mut self, resources: &str) -> StateResult<Self> {
        check_resources(&self.name, resources)?;
        self.resources = resources.to_string();
        Ok(self)
    }

    pub fn with_flags(mut self, flags: &str) -> StateResult<Self> {
        check_flags(&self.name, flags)?;
        self.flags = flags.to_string();
        Ok(self)
    }

    /// True when the resource has no site affinity or lists `site`.
    pub fn available_at(&self, site: &str) -> bool {
        match &self.site {
            None => true,
            Some(sites) => sites.iter().any(|s| s == site),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == ResourceStatus::Idle
    }

    /// idle → locked. Returns false (and changes nothing) if already locked.
    pub fn lock(&mut self, job: JobId) -> bool {
        if !self.is_idle() {
            return false;
        }
        self.status = ResourceStatus::Locked;
        self.job_id = Some(job);
        true
    }

    /// locked → idle. Returns false (and changes nothing) if already idle.
    pub fn release(&mut self) -> bool {
        if self.is_idle() {
            return false;
        }
        self.status = ResourceStatus::Idle;
        self.job_id = None;
        true
    }

    pub fn validate(&self) -> StateResult<()> {
        require_name("resource", &self.name)?;
        if self.restype.trim().is_empty() {
            return Err(StateError::Invalid(format!("resource {} has no type", self.name)));
        }
        match (self.status, self.job_id) {
            (ResourceStatus::Locked, None) => {
                return Err(StateError::Invalid(format!(
                    "resource {} is locked without a job",
                    self.name
                )));
            }
            (ResourceStatus::Idle, Some(job)) => {
                return Err(StateError::Invalid(format!(
                    "resource {} is idle but names job {job}",
                    self.name
                )));
            }
            _ => {}
        }
        check_resources(&self.name, &self.resources)?;
        check_flags(&self.name, &self.flags)
    }
}
