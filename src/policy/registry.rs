//! In-memory snapshot of storage policies, backed by the metadata store.

use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{DriveError, DriveResult};
use crate::metadata::MetadataStorage;
use crate::policy::{PolicyId, StoragePolicy};

/// Read-mostly policy map. Readers get `Arc` snapshots, so a credential
/// rotation never changes a policy underneath a request that already
/// resolved it.
pub struct PolicyRegistry {
    store: Arc<dyn MetadataStorage>,
    policies: RwLock<HashMap<PolicyId, Arc<StoragePolicy>>>,
}

impl PolicyRegistry {
    /// Build the registry from whatever policies the store already holds.
    pub fn load(store: Arc<dyn MetadataStorage>) -> DriveResult<Self> {
        let mut policies = HashMap::new();
        for policy in store.list_policies()? {
            policies.insert(policy.id, Arc::new(policy));
        }
        info!("Loaded {} storage policies", policies.len());
        Ok(Self {
            store,
            policies: RwLock::new(policies),
        })
    }

    pub fn resolve(&self, policy_id: PolicyId) -> DriveResult<Arc<StoragePolicy>> {
        self.read()
            .get(&policy_id)
            .cloned()
            .ok_or(DriveError::PolicyNotFound(policy_id))
    }

    pub fn all(&self) -> Vec<Arc<StoragePolicy>> {
        let mut list: Vec<_> = self.read().values().cloned().collect();
        list.sort_by_key(|p| p.id);
        list
    }

    /// Create or replace a policy. Once files or live sessions reference a
    /// policy, only its credentials may change.
    pub fn upsert(&self, policy: StoragePolicy) -> DriveResult<Arc<StoragePolicy>> {
        policy.validate()?;
        let existing = self.read().get(&policy.id).cloned();
        if let Some(existing) = existing {
            if *existing == policy {
                return Ok(existing);
            }
            if !existing.same_except_credentials(&policy) && self.store.policy_in_use(policy.id)? {
                warn!("Refusing to change referenced policy {}", policy.id);
                return Err(DriveError::Conflict(format!(
                    "policy {} is referenced, only its credentials can change",
                    policy.id
                )));
            }
        }
        self.store.put_policy(&policy)?;
        let policy = Arc::new(policy);
        self.write().insert(policy.id, policy.clone());
        info!("Stored policy {} ({}, {})", policy.id, policy.name, policy.kind);
        Ok(policy)
    }

    /// Credential rotation is the one edit allowed on a referenced policy.
    pub fn rotate_secret(&self, policy_id: PolicyId, access_key: &str, secret: &str) -> DriveResult<()> {
        let current = self.resolve(policy_id)?;
        let mut rotated = (*current).clone();
        rotated.access_key = access_key.to_string();
        rotated.secret = secret.to_string();
        self.store.put_policy(&rotated)?;
        self.write().insert(policy_id, Arc::new(rotated));
        info!("Rotated credentials of policy {}", policy_id);
        Ok(())
    }

    pub fn remove(&self, policy_id: PolicyId) -> DriveResult<()> {
        self.resolve(policy_id)?;
        if self.store.policy_in_use(policy_id)? {
            warn!("Refusing to delete policy {}: still referenced", policy_id);
            return Err(DriveError::Conflict(format!("policy {} is still referenced", policy_id)));
        }
        self.store.delete_policy(policy_id)?;
        self.write().remove(&policy_id);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PolicyId, Arc<StoragePolicy>>> {
        self.policies.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PolicyId, Arc<StoragePolicy>>> {
        self.policies.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
