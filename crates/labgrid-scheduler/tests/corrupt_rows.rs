//! Rows written around the store's validation (e.g. by the job runner) must
//! surface as errors rather than silently drop out of claims and listings.

use std::path::Path;

use labgrid_scheduler::{ClaimRequest, Inventory, LockService, MachineFilter, SchedulerError};
use labgrid_state::tables::{GLOBAL_RESOURCES, MACHINES, SITES};
use labgrid_state::{GlobalResource, Machine, Site, StateStore};
use redb::TableDefinition;
use serde_json::{Value, json};

/// Overwrite one row directly through redb, bypassing `put_*` validation.
fn write_raw(
    path: &Path,
    table: TableDefinition<'static, &'static str, &'static [u8]>,
    key: &str,
    value: &Value,
) {
    let db = redb::Database::create(path).unwrap();
    let txn = db.begin_write().unwrap();
    {
        let mut table = txn.open_table(table).unwrap();
        let bytes = serde_json::to_vec(value).unwrap();
        table.insert(key, bytes.as_slice()).unwrap();
    }
    txn.commit().unwrap();
}

fn seed(path: &Path) {
    let store = StateStore::open(path).unwrap();
    store.put_site(&Site::new("siteA").unwrap().with_flags("lab").unwrap()).unwrap();
    store
        .put_machine(&Machine::new("m1", "siteA", "c1", "default").unwrap())
        .unwrap();
    for name in ["lun0", "lun1"] {
        store
            .put_resource(&GlobalResource::new(name, "nfslun", json!({})).unwrap())
            .unwrap();
    }
}

#[tokio::test]
async fn claim_reports_corrupt_resource_offer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    seed(&path);

    let mut row = serde_json::to_value(GlobalResource::new("lun0", "nfslun", json!({})).unwrap()).unwrap();
    row["resources"] = json!("MEM>=4G");
    write_raw(&path, GLOBAL_RESOURCES, "lun0", &row);

    let store = StateStore::open(&path).unwrap();
    let svc = LockService::new(store);
    let err = svc.claim(&ClaimRequest::new("nfslun", "siteA", 1)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Corrupt { kind: "resource", ref name, .. } if name == "lun0"));
    assert!(!err.is_validation());

    // Nothing was handed out and the table lock was given back.
    assert!(svc.get("lun1").unwrap().is_idle());
    let again = svc.claim(&ClaimRequest::new("nfslun", "siteA", 2)).await;
    assert!(matches!(again, Err(SchedulerError::Corrupt { .. })));
}

#[test]
fn machine_listing_reports_corrupt_offer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    seed(&path);

    let mut row = serde_json::to_value(Machine::new("m1", "siteA", "c1", "default").unwrap()).unwrap();
    row["flags"] = json!("nfs,,lab");
    write_raw(&path, MACHINES, "m1", &row);

    let inv = Inventory::new(StateStore::open(&path).unwrap());
    // Without constraints the offer is never parsed.
    assert_eq!(inv.list_machines(&MachineFilter::default()).unwrap().len(), 1);

    let filter = MachineFilter {
        flags: Some("lab".into()),
        ..MachineFilter::default()
    };
    let err = inv.list_machines(&filter).unwrap_err();
    assert!(matches!(err, SchedulerError::Corrupt { kind: "machine", .. }));
}

#[test]
fn site_listing_reports_corrupt_flags() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    seed(&path);

    let mut row = serde_json::to_value(Site::new("siteA").unwrap()).unwrap();
    row["flags"] = json!("+");
    write_raw(&path, SITES, "siteA", &row);

    let inv = Inventory::new(StateStore::open(&path).unwrap());
    assert_eq!(inv.list_sites(None).unwrap().len(), 1);
    assert!(matches!(
        inv.list_sites(Some("lab")),
        Err(SchedulerError::Corrupt { kind: "site", .. })
    ));
}
