//! Global resource lock service.
//!
//! Each global resource moves between two states, `idle` and `locked`.
//! Claims and releases take the table lock for their whole
//! read-candidates/write step, so two callers can never be handed the same
//! resource. Listing and lookups skip the lock and may be stale.
//!
//! Candidate order: among idle resources of the requested type that are
//! usable from the requested site and satisfy the optional constraints, the
//! one with the lowest name wins.

use std::time::Duration;

use labgrid_constraint::Constraints;
use labgrid_state::{GlobalResource, JobId, LockContext, Locker, StateStore, TableLocker};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{SchedulerError, SchedulerResult};

/// How long a claim or release waits for the table lock by default.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

/// A request to lock one resource of a given type for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimRequest {
    /// Resource type, e.g. `iscsi-lun`.
    pub restype: String,
    /// Site the job runs at.
    pub site: String,
    pub job: JobId,
    /// Optional resource requirement matched against the resource's offer.
    #[serde(default)]
    pub resources: Option<String>,
    /// Optional flag requirement matched against the resource's offer.
    #[serde(default)]
    pub flags: Option<String>,
}

impl ClaimRequest {
    pub fn new(restype: &str, site: &str, job: JobId) -> Self {
        Self {
            restype: restype.to_string(),
            site: site.to_string(),
            job,
            resources: None,
            flags: None,
        }
    }

    /// Check required fields and parse the constraints.
    pub fn validate(&self) -> SchedulerResult<Constraints> {
        if self.restype.trim().is_empty() {
            return Err(SchedulerError::Validation("restype must not be empty".into()));
        }
        if self.site.trim().is_empty() {
            return Err(SchedulerError::Validation("site must not be empty".into()));
        }
        Ok(Constraints::parse(
            self.resources.as_deref(),
            self.flags.as_deref(),
        )?)
    }
}

/// A successful claim: the resource name and its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub name: String,
    pub data: serde_json::Value,
}

impl From<GlobalResource> for Claim {
    fn from(res: GlobalResource) -> Self {
        Self {
            name: res.name,
            data: res.data,
        }
    }
}

/// What to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseTarget {
    /// Every resource locked by this job.
    Job(JobId),
    /// One resource by name.
    Name(String),
}

/// Wire shape of a release: exactly one of `job` or `name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReleaseRequest {
    #[serde(default)]
    pub job: Option<JobId>,
    #[serde(default)]
    pub name: Option<String>,
}

impl TryFrom<ReleaseRequest> for ReleaseTarget {
    type Error = SchedulerError;

    fn try_from(req: ReleaseRequest) -> SchedulerResult<Self> {
        match (req.job, req.name) {
            (Some(job), None) => Ok(ReleaseTarget::Job(job)),
            (None, Some(name)) if !name.trim().is_empty() => Ok(ReleaseTarget::Name(name)),
            (None, Some(_)) => Err(SchedulerError::Validation("name must not be empty".into())),
            (Some(_), Some(_)) => Err(SchedulerError::Validation(
                "specify either job or name, not both".into(),
            )),
            (None, None) => Err(SchedulerError::Validation(
                "specify a job or a resource name to release".into(),
            )),
        }
    }
}

/// Claims and releases global resources under the table lock.
pub struct LockService<L: Locker = TableLocker> {
    store: StateStore,
    locker: L,
    wait: Duration,
}

impl LockService<TableLocker> {
    /// A service with an in-process table lock and the default wait.
    pub fn new(store: StateStore) -> Self {
        Self::with_locker(store, TableLocker::new(), DEFAULT_LOCK_WAIT)
    }
}

impl<L: Locker> LockService<L> {
    pub fn with_locker(store: StateStore, locker: L, wait: Duration) -> Self {
        Self {
            store,
            locker,
            wait,
        }
    }

    /// A fresh request-scoped lock context.
    pub fn context(&self) -> LockContext<'_, L> {
        LockContext::new(&self.locker, self.wait)
    }

    pub fn lock_wait(&self) -> Duration {
        self.wait
    }

    /// Lock the first matching idle resource for `req.job`.
    ///
    /// Returns `Ok(None)` when nothing matches; callers retry on their own
    /// schedule.
    pub async fn claim(&self, req: &ClaimRequest) -> SchedulerResult<Option<Claim>> {
        let mut ctx = self.context();
        self.claim_with(&mut ctx, req).await
    }

    /// Claim inside an existing context. The context may already hold the lock.
    pub async fn claim_with(
        &self,
        ctx: &mut LockContext<'_, L>,
        req: &ClaimRequest,
    ) -> SchedulerResult<Option<Claim>> {
        let constraints = req.validate()?;
        ctx.acquire().await?;
        let result = self.claim_locked(ctx, req, &constraints);
        ctx.release()?;
        result
    }

    fn claim_locked(
        &self,
        ctx: &LockContext<'_, L>,
        req: &ClaimRequest,
        constraints: &Constraints,
    ) -> SchedulerResult<Option<Claim>> {
        ctx.check_held()?;

        let mut candidates: Vec<GlobalResource> = self
            .store
            .list_resources()?
            .into_iter()
            .filter(|res| res.is_idle() && res.restype == req.restype && res.available_at(&req.site))
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        for candidate in candidates {
            match constraints.admits_str(&candidate.resources, &candidate.flags) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(resource = %candidate.name, error = %e, "stored resource offer is malformed");
                    return Err(SchedulerError::corrupt("resource", &candidate.name, e));
                }
            }
            if let Some(locked) = self.store.lock_resource(&candidate.name, req.job)? {
                info!(
                    resource = %locked.name,
                    restype = %req.restype,
                    site = %req.site,
                    job = req.job,
                    "global resource locked"
                );
                return Ok(Some(locked.into()));
            }
        }

        debug!(restype = %req.restype, site = %req.site, job = req.job, "no free resource matched");
        Ok(None)
    }

    /// Claim several resources for one job, all or nothing.
    ///
    /// The lock is held across the whole batch. If any request finds no
    /// candidate, the resources already taken by this batch are released and
    /// `Ok(None)` is returned.
    pub async fn claim_all(&self, requests: &[ClaimRequest]) -> SchedulerResult<Option<Vec<Claim>>> {
        for req in requests {
            req.validate()?;
        }

        let mut ctx = self.context();
        ctx.acquire().await?;
        let mut claimed: Vec<Claim> = Vec::with_capacity(requests.len());
        for req in requests {
            let outcome = self.claim_with(&mut ctx, req).await;
            match outcome {
                Ok(Some(claim)) => claimed.push(claim),
                Ok(None) => {
                    self.roll_back(&claimed)?;
                    ctx.release()?;
                    return Ok(None);
                }
                Err(e) => {
                    self.roll_back(&claimed)?;
                    ctx.release()?;
                    return Err(e);
                }
            }
        }
        ctx.release()?;
        Ok(Some(claimed))
    }

    fn roll_back(&self, claimed: &[Claim]) -> SchedulerResult<()> {
        for claim in claimed {
            self.store.release_resource(&claim.name)?;
        }
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "rolled back partial batch claim");
        }
        Ok(())
    }

    /// Release by job (bulk) or by name. Returns how many resources went idle.
    ///
    /// Releasing an idle or unknown resource is a no-op.
    pub async fn release(&self, target: &ReleaseTarget) -> SchedulerResult<u32> {
        let mut ctx = self.context();
        ctx.acquire().await?;
        let result = match target {
            ReleaseTarget::Job(job) => self.store.release_resources_for_job(*job),
            ReleaseTarget::Name(name) => self.store.release_resource(name).map(u32::from),
        };
        ctx.release()?;
        let released = result?;
        info!(?target, released, "global resource release");
        Ok(released)
    }

    /// All global resources, ordered by name. Does not take the lock.
    pub fn list(&self) -> SchedulerResult<Vec<GlobalResource>> {
        Ok(self.store.list_resources()?)
    }

    /// One global resource by name. Does not take the lock.
    pub fn get(&self, name: &str) -> SchedulerResult<GlobalResource> {
        self.store
            .get_resource(name)?
            .ok_or_else(|| SchedulerError::not_found("resource", name))
    }
}
