//! Key Registry (C2, §4.9): one SSH keypair per cloud-connector per day,
//! idempotent get-or-create, private material encrypted at rest.

use chrono::Utc;
use runnerctl_crypto::{decrypt_text, encrypt_text, EncryptionKey};
use runnerctl_domain::{CloudConnector, Key, KeyId};
use runnerctl_driver::Driver;
use runnerctl_store::{RunnerStore, StoreError};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::PipelineError;

/// Returns the day's key for `connector`, creating and persisting one if
/// none exists yet. A provider-side duplicate-name error is resolved by
/// re-reading the store once — another caller may have won the race.
pub async fn get_daily_key(
    store: &Arc<dyn RunnerStore>,
    driver: &Arc<dyn Driver>,
    encryption_key: &EncryptionKey,
    connector: &CloudConnector,
) -> Result<(Key, String), PipelineError> {
    let today = Utc::now().date_naive();

    if let Some(existing) = store.get_key(today, &connector.id).await? {
        let pem = decrypt_text(encryption_key, &existing.encrypted_material)?;
        return Ok((existing, pem));
    }

    let key_name = format!("Keypair-{}-{}", today.format("%Y-%m-%d"), connector.id);
    info!(connector_id = %connector.id, key_name, "minting daily keypair");
    let material = driver.create_keypair(&key_name).await?;
    let encrypted_material = encrypt_text(encryption_key, &material.private_key_pem);

    let key = Key {
        id: KeyId::new(uuid::Uuid::new_v4().to_string()),
        key_date: today,
        cloud_connector_id: connector.id.clone(),
        cloud_key_id: material.cloud_key_id,
        key_name: material.key_name,
        encrypted_material,
    };

    match store.insert_key(&key).await {
        Ok(()) => Ok((key, material.private_key_pem)),
        Err(StoreError::UniqueViolation(_)) => {
            debug!(connector_id = %connector.id, "lost the race creating today's key, re-reading");
            let winner = store
                .get_key(today, &connector.id)
                .await?
                .ok_or_else(|| {
                    PipelineError::Internal(
                        "key creation collided but no key is present on re-read".into(),
                    )
                })?;
            let pem = decrypt_text(encryption_key, &winner.encrypted_material)?;
            Ok((winner, pem))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runnerctl_domain::{CloudConnectorId, CloudProvider};
    use runnerctl_driver::LocalDriver;
    use runnerctl_store::InMemoryStore;

    fn connector() -> CloudConnector {
        CloudConnector {
            id: CloudConnectorId::new("conn-1"),
            provider: CloudProvider::Local,
            region: "local".into(),
            encrypted_access_key: String::new(),
            encrypted_secret_key: String::new(),
        }
    }

    #[tokio::test]
    async fn second_call_reuses_the_same_key() {
        let store: Arc<dyn RunnerStore> = Arc::new(InMemoryStore::new());
        let driver: Arc<dyn Driver> = Arc::new(LocalDriver::new());
        let enc_key = EncryptionKey::from_str("0123456789abcdef").unwrap();
        let conn = connector();

        let (first, pem1) = get_daily_key(&store, &driver, &enc_key, &conn).await.unwrap();
        let (second, pem2) = get_daily_key(&store, &driver, &enc_key, &conn).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(pem1, pem2);
    }
}
