//! Machine and site inventory.
//!
//! Reads here never take the resource table lock. Machine and site records
//! are written by other endpoints, so whatever a listing returns may already
//! be out of date when the caller acts on it.

use std::collections::{BTreeMap, HashMap};

use labgrid_constraint::{Constraints, parse_offered_flags, parse_offered_resources, parse_required_flags};
use labgrid_state::{SharedResources, Site, StateStore, split_list};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::status::{MachineStatus, PublicStatus, offered_flags};

/// Filters for a machine listing. Empty lists mean "any".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineFilter {
    pub names: Vec<String>,
    pub sites: Vec<String>,
    pub clusters: Vec<String>,
    pub pools: Vec<String>,
    pub statuses: Vec<PublicStatus>,
    /// Current borrowers.
    pub users: Vec<String>,
    /// Resource requirement the machine's offer must satisfy.
    pub resources: Option<String>,
    /// Flag requirement the machine's (and its site's) flags must satisfy.
    pub flags: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Include the per-site `_<site>` pseudo-hosts.
    pub pseudo_hosts: bool,
}

fn allows(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

/// Partial update of a site. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SiteUpdate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ctrladdr: Option<String>,
    #[serde(default)]
    pub maxjobs: Option<u32>,
    /// Replace the flag list.
    #[serde(default)]
    pub flags: Option<Vec<String>>,
    #[serde(default)]
    pub addflags: Vec<String>,
    #[serde(default)]
    pub delflags: Vec<String>,
    /// Key-wise merge; a `null` value deletes the key.
    #[serde(default)]
    pub shared_resources: Option<BTreeMap<String, Option<u32>>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Merge a shared-resource update into the stored counts.
///
/// `None` deletes the key, `Some(n)` sets it, unmentioned keys stay as they are.
pub fn merge_shared_resources(current: &mut SharedResources, update: &BTreeMap<String, Option<u32>>) {
    for (name, value) in update {
        match value {
            Some(count) => current.set(name, *count),
            None => {
                current.remove(name);
            }
        }
    }
}

/// Read and update machines and sites.
#[derive(Clone)]
pub struct Inventory {
    store: StateStore,
}

impl Inventory {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Public status and details of one machine.
    pub fn machine_status(&self, name: &str) -> SchedulerResult<MachineStatus> {
        let machine = self
            .store
            .get_machine(name)?
            .ok_or_else(|| SchedulerError::not_found("machine", name))?;
        let site = self.store.get_site(&machine.site)?;
        Ok(MachineStatus::new(&machine, site.as_ref()))
    }

    /// Machines matching `filter`, ordered by name, then paged.
    pub fn list_machines(&self, filter: &MachineFilter) -> SchedulerResult<Vec<MachineStatus>> {
        let constraints = Constraints::parse(filter.resources.as_deref(), filter.flags.as_deref())?;
        let sites: HashMap<String, Site> = self
            .store
            .list_sites()?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        let mut matched = Vec::new();
        for machine in self.store.list_machines()? {
            if !filter.pseudo_hosts && machine.is_pseudo_host() {
                continue;
            }
            if !allows(&filter.names, &machine.name)
                || !allows(&filter.sites, &machine.site)
                || !allows(&filter.clusters, &machine.cluster)
                || !allows(&filter.pools, &machine.pool)
            {
                continue;
            }
            let site = sites.get(&machine.site);
            let view = MachineStatus::new(&machine, site);

            if !filter.statuses.is_empty() && !filter.statuses.contains(&view.status) {
                continue;
            }
            if !filter.users.is_empty()
                && !view.lease_user.as_ref().is_some_and(|u| filter.users.contains(u))
            {
                continue;
            }
            if !constraints.is_empty() {
                let offer = parse_offered_resources(&machine.resources)
                    .and_then(|res| Ok((res, offered_flags(&machine, site)?)));
                match offer {
                    Ok((resources, flags)) if constraints.admits(&resources, &flags) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        error!(machine = %machine.name, error = %e, "stored machine offer is malformed");
                        return Err(SchedulerError::corrupt("machine", &machine.name, e));
                    }
                }
            }
            matched.push(view);
        }

        let total = matched.len();
        let page: Vec<MachineStatus> = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        debug!(total, returned = page.len(), "machine listing");
        Ok(page)
    }

    /// Sites whose flags satisfy `flags` (all sites when `None`).
    pub fn list_sites(&self, flags: Option<&str>) -> SchedulerResult<Vec<Site>> {
        let required = parse_required_flags(flags.unwrap_or(""))?;
        let mut sites = Vec::new();
        for site in self.store.list_sites()? {
            if !required.is_empty() {
                match parse_offered_flags(&site.flags) {
                    Ok(offered) if offered.satisfies(&required) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        error!(site = %site.name, error = %e, "stored site flags are malformed");
                        return Err(SchedulerError::corrupt("site", &site.name, e));
                    }
                }
            }
            sites.push(site);
        }
        Ok(sites)
    }

    pub fn get_site(&self, name: &str) -> SchedulerResult<Site> {
        self.store
            .get_site(name)?
            .ok_or_else(|| SchedulerError::not_found("site", name))
    }

    /// Apply a partial update to a site in one store transaction.
    pub fn update_site(&self, name: &str, update: &SiteUpdate) -> SchedulerResult<Site> {
        for flag in update.flags.iter().flatten().chain(&update.addflags) {
            parse_offered_flags(flag)?;
        }

        let updated = self
            .store
            .modify_site(name, |site| {
                apply_site_update(site, update);
                Ok(site.clone())
            })?
            .ok_or_else(|| SchedulerError::not_found("site", name))?;
        info!(site = %name, shared_resources = %updated.shared_resources, "site updated");
        Ok(updated)
    }

    /// Merge shared-resource counts into a site; `None` deletes a key.
    pub fn update_site_shared_resources(
        &self,
        name: &str,
        update: &BTreeMap<String, Option<u32>>,
    ) -> SchedulerResult<Site> {
        let req = SiteUpdate {
            shared_resources: Some(update.clone()),
            ..SiteUpdate::default()
        };
        self.update_site(name, &req)
    }
}

fn apply_site_update(site: &mut Site, update: &SiteUpdate) {
    if let Some(description) = &update.description {
        site.description = Some(description.clone());
    }
    if let Some(ctrladdr) = &update.ctrladdr {
        site.ctrladdr = Some(ctrladdr.clone());
    }
    if let Some(maxjobs) = update.maxjobs {
        site.maxjobs = Some(maxjobs);
    }
    if let Some(status) = &update.status {
        site.status = status.clone();
    }
    if let Some(location) = &update.location {
        site.location = Some(location.clone());
    }

    let mut flags = match &update.flags {
        Some(flags) => flags.clone(),
        None => split_list(&site.flags),
    };
    for flag in &update.addflags {
        if !flags.contains(flag) {
            flags.push(flag.clone());
        }
    }
    flags.retain(|f| !update.delflags.contains(f));
    site.flags = flags.join(",");

    if let Some(shared) = &update.shared_resources {
        merge_shared_resources(&mut site.shared_resources, shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labgrid_state::{Machine, RawStatus};

    fn inventory() -> Inventory {
        let store = StateStore::open_in_memory().unwrap();

        let mut site_a = Site::new("siteA").unwrap().with_flags("+lab").unwrap();
        site_a.shared_resources.set("NFS", 4);
        store.put_site(&site_a).unwrap();
        store.put_site(&Site::new("siteB").unwrap().with_flags("cloud").unwrap()).unwrap();

        let machines = [
            Machine::new("a1", "siteA", "c1", "default").unwrap().with_resources("MEM=64G/CPUS=16").unwrap(),
            Machine::new("a2", "siteA", "c1", "defaultx").unwrap().with_resources("MEM=8G").unwrap(),
            Machine::new("a3", "siteA", "c2", "default")
                .unwrap()
                .with_status(RawStatus::Running)
                .with_flags("nfs")
                .unwrap(),
            Machine::new("b1", "siteB", "c1", "default")
                .unwrap()
                .with_resources("MEM=32G")
                .unwrap()
                .with_lease("alice", 100, 200, Some("debugging")),
            Machine::new("b2", "siteB", "c1", "default").unwrap().with_status(RawStatus::from("dead")),
        ];
        for m in &machines {
            store.put_machine(m).unwrap();
        }
        Inventory::new(store)
    }

    fn names(list: &[MachineStatus]) -> Vec<&str> {
        list.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn machine_status_lookup() {
        let inv = inventory();
        let b1 = inv.machine_status("b1").unwrap();
        assert_eq!(b1.status, PublicStatus::Borrowed);
        assert_eq!(b1.lease_user.as_deref(), Some("alice"));
        assert_eq!(b1.lease_to, Some(200));
        assert!(matches!(inv.machine_status("zz"), Err(SchedulerError::NotFound { .. })));
    }

    #[test]
    fn pseudo_hosts_are_hidden_by_default() {
        let inv = inventory();
        inv.store
            .put_machine(&Machine::new("_siteA", "siteA", "c1", "default").unwrap())
            .unwrap();

        let listed = inv.list_machines(&MachineFilter::default()).unwrap();
        assert!(!names(&listed).contains(&"_siteA"));

        let filter = MachineFilter {
            pseudo_hosts: true,
            ..MachineFilter::default()
        };
        assert_eq!(names(&inv.list_machines(&filter).unwrap())[0], "_siteA");
        assert!(inv.machine_status("_siteA").is_ok());
    }

    #[test]
    fn filter_by_status() {
        let inv = inventory();
        let filter = MachineFilter {
            statuses: vec![PublicStatus::Idle],
            ..MachineFilter::default()
        };
        assert_eq!(names(&inv.list_machines(&filter).unwrap()), ["a1"]);

        let filter = MachineFilter {
            statuses: vec![PublicStatus::Broken, PublicStatus::Offline],
            ..MachineFilter::default()
        };
        assert_eq!(names(&inv.list_machines(&filter).unwrap()), ["a2", "b2"]);
    }

    #[test]
    fn filter_by_membership_and_user() {
        let inv = inventory();
        let filter = MachineFilter {
            sites: vec!["siteA".into()],
            clusters: vec!["c1".into()],
            ..MachineFilter::default()
        };
        assert_eq!(names(&inv.list_machines(&filter).unwrap()), ["a1", "a2"]);

        let filter = MachineFilter {
            users: vec!["alice".into()],
            ..MachineFilter::default()
        };
        assert_eq!(names(&inv.list_machines(&filter).unwrap()), ["b1"]);
    }

    #[test]
    fn filter_by_resources_and_flags() {
        let inv = inventory();
        let filter = MachineFilter {
            resources: Some("MEM>=16G".into()),
            ..MachineFilter::default()
        };
        // siteA machines carry the mandatory +lab site flag, so only b1 passes.
        assert_eq!(names(&inv.list_machines(&filter).unwrap()), ["b1"]);

        let filter = MachineFilter {
            resources: Some("MEM>=16G".into()),
            flags: Some("~lab".into()),
            ..MachineFilter::default()
        };
        assert_eq!(names(&inv.list_machines(&filter).unwrap()), ["a1", "b1"]);

        let filter = MachineFilter {
            flags: Some("lab,nfs".into()),
            ..MachineFilter::default()
        };
        assert_eq!(names(&inv.list_machines(&filter).unwrap()), ["a3"]);
    }

    #[test]
    fn malformed_filter_is_rejected() {
        let inv = inventory();
        let filter = MachineFilter {
            resources: Some("MEM>>1".into()),
            ..MachineFilter::default()
        };
        assert!(matches!(inv.list_machines(&filter), Err(SchedulerError::Constraint(_))));
    }

    #[test]
    fn paging_applies_after_filtering() {
        let inv = inventory();
        let filter = MachineFilter {
            sites: vec!["siteA".into()],
            limit: Some(1),
            offset: 1,
            ..MachineFilter::default()
        };
        assert_eq!(names(&inv.list_machines(&filter).unwrap()), ["a2"]);
    }

    #[test]
    fn sites_filtered_by_flags() {
        let inv = inventory();
        assert_eq!(inv.list_sites(None).unwrap().len(), 2);
        let cloud: Vec<_> = inv.list_sites(Some("cloud")).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(cloud, ["siteB"]);
        let lab: Vec<_> = inv.list_sites(Some("lab")).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(lab, ["siteA"]);
    }

    #[test]
    fn merge_sets_and_deletes_keys() {
        let mut current: SharedResources = "NFS=4/ISCSI=2/LIC=1".parse().unwrap();
        let update = BTreeMap::from([
            ("NFS".to_string(), Some(6)),
            ("ISCSI".to_string(), None),
            ("GPU".to_string(), Some(0)),
        ]);
        merge_shared_resources(&mut current, &update);
        assert_eq!(current.to_string(), "GPU=0/LIC=1/NFS=6");
        assert_eq!(current.get("ISCSI"), None);
    }

    #[test]
    fn update_shared_resources_persists_text_form() {
        let inv = inventory();
        let update = BTreeMap::from([("NFS".to_string(), None), ("LIC".to_string(), Some(3))]);
        let site = inv.update_site_shared_resources("siteA", &update).unwrap();
        assert_eq!(site.shared_resources.to_string(), "LIC=3");
        assert_eq!(inv.get_site("siteA").unwrap().shared_resources.get("LIC"), Some(3));
    }

    #[test]
    fn update_site_flags_and_fields() {
        let inv = inventory();
        let update = SiteUpdate {
            addflags: vec!["nfs".into(), "+lab".into()],
            delflags: vec!["+lab".into()],
            maxjobs: Some(12),
            description: Some("rack 4".into()),
            ..SiteUpdate::default()
        };
        let site = inv.update_site("siteA", &update).unwrap();
        assert_eq!(site.flags, "nfs");
        assert_eq!(site.maxjobs, Some(12));
        assert_eq!(site.description.as_deref(), Some("rack 4"));
        assert_eq!(site.shared_resources.get("NFS"), Some(4));
    }

    #[test]
    fn update_rejects_bad_flags_and_unknown_site() {
        let inv = inventory();
        let update = SiteUpdate {
            addflags: vec!["a b".into()],
            ..SiteUpdate::default()
        };
        assert!(inv.update_site("siteA", &update).unwrap_err().is_validation());
        assert!(matches!(
            inv.update_site("nowhere", &SiteUpdate::default()),
            Err(SchedulerError::NotFound { .. })
        ));
    }
}
