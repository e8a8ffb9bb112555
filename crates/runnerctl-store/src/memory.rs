use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use runnerctl_domain::{
    CloudConnector, CloudConnectorId, CloudProvider, Image, ImageId, Key, Machine, MachineId,
    Runner, RunnerHistory, RunnerId, RunnerSecurityGroup, RunnerState, Script, SecurityGroup,
    SecurityGroupId, UserId,
};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::RunnerStore;

#[derive(Debug, Default)]
struct Inner {
    runners: HashMap<RunnerId, Runner>,
    history: Vec<RunnerHistory>,
    images: HashMap<ImageId, Image>,
    machines: HashMap<MachineId, Machine>,
    cloud_connectors: HashMap<CloudConnectorId, CloudConnector>,
    keys: HashMap<(NaiveDate, CloudConnectorId), Key>,
    security_groups: HashMap<SecurityGroupId, SecurityGroup>,
    runner_security_groups: Vec<RunnerSecurityGroup>,
    scripts: Vec<Script>,
}

/// In-memory implementation of [`RunnerStore`].
///
/// All data is lost on process exit. Used by tests and by [`LocalDriver`]
/// single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunnerStore for InMemoryStore {
    async fn insert_runner(&self, runner: &Runner) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.runners.insert(runner.id.clone(), runner.clone());
        Ok(())
    }

    async fn get_runner(&self, id: &RunnerId) -> Result<Option<Runner>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.runners.get(id).cloned())
    }

    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.runners.values().cloned().collect())
    }

    async fn put_runner(&self, runner: &Runner) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.runners.insert(runner.id.clone(), runner.clone());
        Ok(())
    }

    async fn conditional_update(
        &self,
        id: &RunnerId,
        expected_state: RunnerState,
        apply: Box<dyn FnOnce(&mut Runner) + Send>,
    ) -> Result<Runner, StoreError> {
        let mut guard = self.inner.write().await;
        let runner = guard
            .runners
            .get_mut(id)
            .ok_or_else(|| StoreError::RunnerNotFound(id.to_string()))?;
        if runner.state != expected_state {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_state,
            });
        }
        apply(runner);
        runner.updated_on = Utc::now();
        Ok(runner.clone())
    }

    async fn claim_ready_for_image(
        &self,
        image_id: &ImageId,
        user_id: &UserId,
    ) -> Result<Option<Runner>, StoreError> {
        let mut guard = self.inner.write().await;
        let candidate_id = guard
            .runners
            .values()
            .filter(|r| r.image_id == *image_id && r.state == RunnerState::Ready)
            .min_by_key(|r| r.created_at)
            .map(|r| r.id.clone());

        let Some(candidate_id) = candidate_id else {
            return Ok(None);
        };

        let runner = guard.runners.get_mut(&candidate_id).expect("just located");
        runner.state = RunnerState::ReadyClaimed;
        runner.user_id = Some(user_id.clone());
        runner.updated_on = Utc::now();
        Ok(Some(runner.clone()))
    }

    async fn find_existing_for_user(
        &self,
        image_id: &ImageId,
        user_id: &UserId,
    ) -> Result<Option<Runner>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .runners
            .values()
            .find(|r| {
                r.image_id == *image_id
                    && r.user_id.as_ref() == Some(user_id)
                    && r.state.is_alive()
            })
            .cloned())
    }

    async fn list_ready_for_image(&self, image_id: &ImageId) -> Result<Vec<Runner>, StoreError> {
        let guard = self.inner.read().await;
        let mut runners: Vec<Runner> = guard
            .runners
            .values()
            .filter(|r| r.image_id == *image_id && r.state == RunnerState::Ready)
            .cloned()
            .collect();
        runners.sort_by_key(|r| r.created_at);
        Ok(runners)
    }

    async fn count_ready_for_image(&self, image_id: &ImageId) -> Result<u32, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .runners
            .values()
            .filter(|r| r.image_id == *image_id && r.state == RunnerState::Ready)
            .count() as u32)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Runner>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .runners
            .values()
            .filter(|r| r.state.is_alive() && r.session_end.is_some_and(|end| end <= now))
            .cloned()
            .collect())
    }

    async fn list_idle_ready(&self, threshold: DateTime<Utc>) -> Result<Vec<Runner>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .runners
            .values()
            .filter(|r| r.state == RunnerState::Ready && r.updated_on <= threshold)
            .cloned()
            .collect())
    }

    async fn insert_history(&self, entry: &RunnerHistory) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.history.push(entry.clone());
        Ok(())
    }

    async fn list_history(&self, runner_id: &RunnerId) -> Result<Vec<RunnerHistory>, StoreError> {
        let guard = self.inner.read().await;
        let mut entries: Vec<RunnerHistory> = guard
            .history
            .iter()
            .filter(|e| e.runner_id == *runner_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn upsert_image(&self, image: &Image) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.images.insert(image.id.clone(), image.clone());
        Ok(())
    }

    async fn get_image(&self, id: &ImageId) -> Result<Option<Image>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.images.get(id).cloned())
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.images.values().cloned().collect())
    }

    async fn upsert_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.machines.insert(machine.id.clone(), machine.clone());
        Ok(())
    }

    async fn get_machine(&self, id: &MachineId) -> Result<Option<Machine>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.machines.get(id).cloned())
    }

    async fn list_machines(&self) -> Result<Vec<Machine>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.machines.values().cloned().collect())
    }

    async fn upsert_cloud_connector(&self, connector: &CloudConnector) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .cloud_connectors
            .insert(connector.id.clone(), connector.clone());
        Ok(())
    }

    async fn get_cloud_connector(
        &self,
        id: &CloudConnectorId,
    ) -> Result<Option<CloudConnector>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.cloud_connectors.get(id).cloned())
    }

    async fn list_cloud_connectors(&self) -> Result<Vec<CloudConnector>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.cloud_connectors.values().cloned().collect())
    }

    async fn list_cloud_connectors_by_provider(
        &self,
        provider: CloudProvider,
    ) -> Result<Vec<CloudConnector>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .cloud_connectors
            .values()
            .filter(|c| c.provider == provider)
            .cloned()
            .collect())
    }

    async fn get_key(
        &self,
        key_date: NaiveDate,
        cloud_connector_id: &CloudConnectorId,
    ) -> Result<Option<Key>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .keys
            .get(&(key_date, cloud_connector_id.clone()))
            .cloned())
    }

    async fn insert_key(&self, key: &Key) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let entry_key = (key.key_date, key.cloud_connector_id.clone());
        if guard.keys.contains_key(&entry_key) {
            return Err(StoreError::UniqueViolation(format!(
                "key already exists for {} on {}",
                key.cloud_connector_id, key.key_date
            )));
        }
        guard.keys.insert(entry_key, key.clone());
        Ok(())
    }

    async fn upsert_security_group(&self, sg: &SecurityGroup) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.security_groups.insert(sg.id.clone(), sg.clone());
        Ok(())
    }

    async fn get_security_group(
        &self,
        id: &SecurityGroupId,
    ) -> Result<Option<SecurityGroup>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.security_groups.get(id).cloned())
    }

    async fn link_runner_security_group(
        &self,
        link: &RunnerSecurityGroup,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.runner_security_groups.iter().any(|l| {
            l.runner_id == link.runner_id && l.security_group_id == link.security_group_id
        }) {
            guard.runner_security_groups.push(link.clone());
        }
        Ok(())
    }

    async fn unlink_runner_security_group(
        &self,
        runner_id: &RunnerId,
        sg_id: &SecurityGroupId,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .runner_security_groups
            .retain(|l| !(l.runner_id == *runner_id && l.security_group_id == *sg_id));
        Ok(())
    }

    async fn security_groups_for_runner(
        &self,
        runner_id: &RunnerId,
    ) -> Result<Vec<SecurityGroup>, StoreError> {
        let guard = self.inner.read().await;
        let ids: Vec<SecurityGroupId> = guard
            .runner_security_groups
            .iter()
            .filter(|l| l.runner_id == *runner_id)
            .map(|l| l.security_group_id.clone())
            .collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| guard.security_groups.get(&id).cloned())
            .collect())
    }

    async fn security_group_reference_count(
        &self,
        sg_id: &SecurityGroupId,
    ) -> Result<u32, StoreError> {
        let guard = self.inner.read().await;
        let count = guard
            .runner_security_groups
            .iter()
            .filter(|l| l.security_group_id == *sg_id)
            .filter(|l| {
                guard
                    .runners
                    .get(&l.runner_id)
                    .is_some_and(|r| r.state.is_alive())
            })
            .count();
        Ok(count as u32)
    }

    async fn upsert_script(&self, script: &Script) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.scripts.iter_mut().find(|s| s.id == script.id) {
            *existing = script.clone();
        } else {
            guard.scripts.push(script.clone());
        }
        Ok(())
    }

    async fn scripts_for_image(&self, image_id: &ImageId) -> Result<Vec<Script>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .scripts
            .iter()
            .filter(|s| s.image_id.is_none() || s.image_id.as_ref() == Some(image_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn runner(id: &str, image: &str, state: RunnerState) -> Runner {
        let now = Utc::now();
        Runner {
            id: RunnerId::new(id),
            cloud_instance_id: None,
            external_hash: "hash".into(),
            image_id: ImageId::new(image),
            machine_id: MachineId::new("m1"),
            key_id: None,
            user_id: None,
            state,
            public_ip: None,
            user_ip: None,
            lifecycle_token: None,
            terminal_token: None,
            session_start: None,
            session_end: None,
            ended_on: None,
            env_data: StdHashMap::new(),
            created_at: now,
            updated_on: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get_roundtrips() {
        let store = InMemoryStore::new();
        let r = runner("r1", "img1", RunnerState::Ready);
        store.insert_runner(&r).await.unwrap();
        let fetched = store.get_runner(&r.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, r.id);
    }

    #[tokio::test]
    async fn claim_ready_for_image_picks_oldest_and_binds_user() {
        let store = InMemoryStore::new();
        let mut older = runner("r1", "img1", RunnerState::Ready);
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = runner("r2", "img1", RunnerState::Ready);
        store.insert_runner(&older).await.unwrap();
        store.insert_runner(&newer).await.unwrap();

        let claimed = store
            .claim_ready_for_image(&ImageId::new("img1"), &UserId::new("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, older.id);
        assert_eq!(claimed.state, RunnerState::ReadyClaimed);
        assert_eq!(claimed.user_id, Some(UserId::new("u1")));
    }

    #[tokio::test]
    async fn claim_ready_for_image_returns_none_when_empty() {
        let store = InMemoryStore::new();
        let claimed = store
            .claim_ready_for_image(&ImageId::new("missing"), &UserId::new("u1"))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_expected_state() {
        let store = InMemoryStore::new();
        let r = runner("r1", "img1", RunnerState::Active);
        store.insert_runner(&r).await.unwrap();

        let err = store
            .conditional_update(&r.id, RunnerState::Ready, Box::new(|r| r.state = RunnerState::Terminating))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn conditional_update_applies_when_state_matches() {
        let store = InMemoryStore::new();
        let r = runner("r1", "img1", RunnerState::Active);
        store.insert_runner(&r).await.unwrap();

        let updated = store
            .conditional_update(
                &r.id,
                RunnerState::Active,
                Box::new(|r| r.state = RunnerState::Disconnecting),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, RunnerState::Disconnecting);
    }

    #[tokio::test]
    async fn insert_key_rejects_duplicate_date_connector_pair() {
        let store = InMemoryStore::new();
        let key = Key {
            id: runnerctl_domain::KeyId::new("k1"),
            key_date: chrono::Utc::now().date_naive(),
            cloud_connector_id: CloudConnectorId::new("c1"),
            cloud_key_id: "aws-key-1".into(),
            key_name: "runner-2026-07-28".into(),
            encrypted_material: "cipher".into(),
        };
        store.insert_key(&key).await.unwrap();
        let err = store.insert_key(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn security_group_reference_count_only_counts_alive_runners() {
        let store = InMemoryStore::new();
        let sg_id = SecurityGroupId::new("sg1");
        let alive = runner("r1", "img1", RunnerState::Active);
        let dead = runner("r2", "img1", RunnerState::Terminated);
        store.insert_runner(&alive).await.unwrap();
        store.insert_runner(&dead).await.unwrap();
        store
            .link_runner_security_group(&RunnerSecurityGroup {
                runner_id: alive.id.clone(),
                security_group_id: sg_id.clone(),
            })
            .await
            .unwrap();
        store
            .link_runner_security_group(&RunnerSecurityGroup {
                runner_id: dead.id.clone(),
                security_group_id: sg_id.clone(),
            })
            .await
            .unwrap();

        let count = store.security_group_reference_count(&sg_id).await.unwrap();
        assert_eq!(count, 1);
    }
}
