use async_trait::async_trait;
use runnerctl_domain::{
    CloudConnector, CloudConnectorId, CloudProvider, Image, ImageId, Key, Machine, MachineId,
    Runner, RunnerHistory, RunnerId, RunnerSecurityGroup, RunnerState, Script, SecurityGroup,
    SecurityGroupId, UserId,
};
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;

/// Persistence surface for the orchestration engine. One fat trait bundling
/// every entity the reconciler touches, the way a single `StateStore` bundles
/// unrelated resource kinds when they all share one backing database.
#[async_trait]
pub trait RunnerStore: Send + Sync + 'static {
    // ── Runner CRUD ──────────────────────────────────────────────────────
    async fn insert_runner(&self, runner: &Runner) -> Result<(), StoreError>;
    async fn get_runner(&self, id: &RunnerId) -> Result<Option<Runner>, StoreError>;
    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError>;

    /// Full replace of a runner row. Callers that need a race-safe,
    /// state-gated update should use [`RunnerStore::conditional_update`] instead.
    async fn put_runner(&self, runner: &Runner) -> Result<(), StoreError>;

    /// Read-modify-write gated on the runner's current state still matching
    /// `expected_state` (§5 "optimistic: read-state → validate → conditional
    /// write; on conflict, retry"). Returns [`StoreError::Conflict`] if
    /// another writer changed the state first.
    async fn conditional_update(
        &self,
        id: &RunnerId,
        expected_state: RunnerState,
        apply: Box<dyn FnOnce(&mut Runner) + Send>,
    ) -> Result<Runner, StoreError>;

    /// Atomically claims one `ready` runner for `image_id` on behalf of
    /// `user_id`, flipping it to `ready_claimed` (§5 "Pool-allocation race",
    /// §8 Invariant 4). Picks the oldest-created eligible runner. Returns
    /// `None` if no `ready` runner exists for the image.
    async fn claim_ready_for_image(
        &self,
        image_id: &ImageId,
        user_id: &UserId,
    ) -> Result<Option<Runner>, StoreError>;

    /// A still-alive runner already bound to `user_id` for `image_id`
    /// (existing-runner discovery, §4.4 stage `existing`).
    async fn find_existing_for_user(
        &self,
        image_id: &ImageId,
        user_id: &UserId,
    ) -> Result<Option<Runner>, StoreError>;

    /// All `ready` runners for `image_id`, oldest first (pool scale-down,
    /// idle reclaim).
    async fn list_ready_for_image(&self, image_id: &ImageId) -> Result<Vec<Runner>, StoreError>;

    /// Count of `ready` runners for `image_id` (pool controller's current
    /// warm count, §4.6).
    async fn count_ready_for_image(&self, image_id: &ImageId) -> Result<u32, StoreError>;

    /// Alive runners whose `session_end` has passed (Expiry Reaper, §4.9).
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Runner>, StoreError>;

    /// `ready` runners whose `updated_on` is older than `threshold` (idle
    /// warm-pool reclaim, §4.6).
    async fn list_idle_ready(&self, threshold: DateTime<Utc>) -> Result<Vec<Runner>, StoreError>;

    // ── Runner history ───────────────────────────────────────────────────
    async fn insert_history(&self, entry: &RunnerHistory) -> Result<(), StoreError>;
    async fn list_history(&self, runner_id: &RunnerId) -> Result<Vec<RunnerHistory>, StoreError>;

    // ── Image / Machine / CloudConnector (config-loaded, mutable pool_size) ─
    async fn upsert_image(&self, image: &Image) -> Result<(), StoreError>;
    async fn get_image(&self, id: &ImageId) -> Result<Option<Image>, StoreError>;
    async fn list_images(&self) -> Result<Vec<Image>, StoreError>;

    async fn upsert_machine(&self, machine: &Machine) -> Result<(), StoreError>;
    async fn get_machine(&self, id: &MachineId) -> Result<Option<Machine>, StoreError>;
    async fn list_machines(&self) -> Result<Vec<Machine>, StoreError>;

    async fn upsert_cloud_connector(&self, connector: &CloudConnector) -> Result<(), StoreError>;
    async fn get_cloud_connector(
        &self,
        id: &CloudConnectorId,
    ) -> Result<Option<CloudConnector>, StoreError>;
    async fn list_cloud_connectors(&self) -> Result<Vec<CloudConnector>, StoreError>;
    async fn list_cloud_connectors_by_provider(
        &self,
        provider: CloudProvider,
    ) -> Result<Vec<CloudConnector>, StoreError>;

    // ── Key Registry (C2) ────────────────────────────────────────────────
    /// Idempotent get-or-create is implemented by the caller (read, then
    /// `insert_key` under a `UNIQUE(key_date, cloud_connector_id)` guard);
    /// the store only enforces uniqueness.
    async fn get_key(
        &self,
        key_date: NaiveDate,
        cloud_connector_id: &CloudConnectorId,
    ) -> Result<Option<Key>, StoreError>;
    async fn insert_key(&self, key: &Key) -> Result<(), StoreError>;

    // ── Security Groups (C3) ─────────────────────────────────────────────
    async fn upsert_security_group(&self, sg: &SecurityGroup) -> Result<(), StoreError>;
    async fn get_security_group(
        &self,
        id: &SecurityGroupId,
    ) -> Result<Option<SecurityGroup>, StoreError>;
    async fn link_runner_security_group(&self, link: &RunnerSecurityGroup) -> Result<(), StoreError>;
    async fn unlink_runner_security_group(
        &self,
        runner_id: &RunnerId,
        sg_id: &SecurityGroupId,
    ) -> Result<(), StoreError>;
    async fn security_groups_for_runner(
        &self,
        runner_id: &RunnerId,
    ) -> Result<Vec<SecurityGroup>, StoreError>;
    /// Number of still-alive runners referencing `sg_id` (reference-counted
    /// GC, §4.10 C3).
    async fn security_group_reference_count(
        &self,
        sg_id: &SecurityGroupId,
    ) -> Result<u32, StoreError>;

    // ── Scripts (config-loaded, per-image template bodies) ───────────────
    async fn upsert_script(&self, script: &Script) -> Result<(), StoreError>;
    async fn scripts_for_image(&self, image_id: &ImageId) -> Result<Vec<Script>, StoreError>;
}
