//! Security-Group Manager (C3, §4, §8): per-runner SG lifecycle, admits the
//! claiming user's IP on port 3000, reference-counts at termination time and
//! only deletes the cloud-side group once nothing alive still points at it.

use std::sync::Arc;

use runnerctl_domain::{
    CloudConnectorId, Runner, RunnerSecurityGroup, SecurityGroup, SecurityGroupId,
    SecurityGroupStatus,
};
use runnerctl_driver::Driver;
use runnerctl_store::RunnerStore;
use tracing::{info, warn};

use crate::error::PipelineError;

const CLAIM_PORT: u16 = 3000;

/// Creates a fresh security group for `runner` and authorizes `user_ip` (if
/// present) on the claim port. Always links the runner to the group so GC
/// can find it later, even when there is no client IP yet to admit.
pub async fn provision_for_runner(
    store: &Arc<dyn RunnerStore>,
    driver: &Arc<dyn Driver>,
    runner: &Runner,
    connector_id: &CloudConnectorId,
    user_ip: Option<&str>,
) -> Result<SecurityGroup, PipelineError> {
    let name = format!("runner-{}", runner.id);
    let cloud_group_id = driver.create_security_group(&name, "runner security group").await?;

    if let Some(ip) = user_ip {
        let cidr = format!("{ip}/32");
        driver.authorize_ingress(&cloud_group_id, &cidr, CLAIM_PORT).await?;
    }

    let sg = SecurityGroup {
        id: SecurityGroupId::new(uuid::Uuid::new_v4().to_string()),
        cloud_group_id,
        cloud_connector_id: connector_id.clone(),
        inbound_rules: serde_json::json!(user_ip.map(|ip| serde_json::json!({
            "cidr": format!("{ip}/32"), "port": CLAIM_PORT,
        }))),
        status: SecurityGroupStatus::Active,
    };
    store.upsert_security_group(&sg).await?;
    store
        .link_runner_security_group(&RunnerSecurityGroup {
            runner_id: runner.id.clone(),
            security_group_id: sg.id.clone(),
        })
        .await?;

    Ok(sg)
}

/// Admits `user_ip` on the claim port for every SG already linked to
/// `runner` (claim-time authorization for pool/existing runners whose SG
/// predates this user).
pub async fn authorize_claim_ip(
    store: &Arc<dyn RunnerStore>,
    driver: &Arc<dyn Driver>,
    runner_id: &runnerctl_domain::RunnerId,
    user_ip: &str,
) -> Result<(), PipelineError> {
    let cidr = format!("{user_ip}/32");
    for sg in store.security_groups_for_runner(runner_id).await? {
        if sg.status == SecurityGroupStatus::Active {
            driver.authorize_ingress(&sg.cloud_group_id, &cidr, CLAIM_PORT).await?;
        }
    }
    Ok(())
}

/// Reference-counted GC (§4.3 step 6): for each SG associated with
/// `runner_id`, delete at the cloud provider once no alive runner still
/// references it. Called after the runner's own state has already gone
/// terminal, so the runner being torn down never counts against itself.
pub async fn gc_for_runner(
    store: &Arc<dyn RunnerStore>,
    driver: &Arc<dyn Driver>,
    runner_id: &runnerctl_domain::RunnerId,
) -> Result<(), PipelineError> {
    for sg in store.security_groups_for_runner(runner_id).await? {
        if sg.status != SecurityGroupStatus::Active {
            continue;
        }
        let refcount = store.security_group_reference_count(&sg.id).await?;
        if refcount == 0 {
            match driver.delete_security_group(&sg.cloud_group_id).await {
                Ok(()) => {
                    let mut deleted = sg.clone();
                    deleted.status = SecurityGroupStatus::Deleted;
                    store.upsert_security_group(&deleted).await?;
                    info!(sg_id = %sg.id, "security group deleted, no remaining references");
                }
                Err(e) => warn!(sg_id = %sg.id, error = %e, "security group delete failed, left in place"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runnerctl_domain::{CloudConnectorId, ImageId, MachineId, RunnerId, RunnerState};
    use runnerctl_driver::LocalDriver;
    use runnerctl_store::InMemoryStore;

    fn bare_runner(id: &str) -> Runner {
        let now = chrono::Utc::now();
        Runner {
            id: RunnerId::new(id),
            cloud_instance_id: None,
            external_hash: "h".into(),
            image_id: ImageId::new("img-1"),
            machine_id: MachineId::new("m1"),
            key_id: None,
            user_id: None,
            state: RunnerState::RunnerStarting,
            public_ip: None,
            user_ip: None,
            lifecycle_token: None,
            terminal_token: None,
            session_start: None,
            session_end: None,
            ended_on: None,
            env_data: Default::default(),
            created_at: now,
            updated_on: now,
        }
    }

    #[tokio::test]
    async fn gc_deletes_only_when_unreferenced() {
        let store: Arc<dyn RunnerStore> = Arc::new(InMemoryStore::new());
        let driver: Arc<dyn Driver> = Arc::new(LocalDriver::new());
        let mut r1 = bare_runner("r1");
        let mut r2 = bare_runner("r2");
        store.insert_runner(&r1).await.unwrap();
        store.insert_runner(&r2).await.unwrap();
        let connector_id = CloudConnectorId::new("conn-1");

        let sg = provision_for_runner(&store, &driver, &r1, &connector_id, Some("1.2.3.4"))
            .await
            .unwrap();
        store
            .link_runner_security_group(&RunnerSecurityGroup {
                runner_id: r2.id.clone(),
                security_group_id: sg.id.clone(),
            })
            .await
            .unwrap();

        // r1 terminates; r2 still alive, so the SG must survive.
        r1.state = RunnerState::Terminated;
        store.put_runner(&r1).await.unwrap();
        gc_for_runner(&store, &driver, &r1.id).await.unwrap();
        let still_there = store.get_security_group(&sg.id).await.unwrap().unwrap();
        assert_eq!(still_there.status, SecurityGroupStatus::Active);

        // now r2 terminates too; GC run against either runner should delete it.
        r2.state = RunnerState::Terminated;
        store.put_runner(&r2).await.unwrap();
        gc_for_runner(&store, &driver, &r2.id).await.unwrap();
        let gone = store.get_security_group(&sg.id).await.unwrap().unwrap();
        assert_eq!(gone.status, SecurityGroupStatus::Deleted);
    }
}
