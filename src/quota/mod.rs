//! Per-user storage accounting: used bytes, in-flight reservations and the
//! group a user belongs to.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

use crate::error::{DriveError, DriveResult};
use crate::metadata::{Group, GroupId, MetadataStorage, QuotaReservation, QuotaUsage, UserAccount, UserId};
use crate::policy::PolicyId;

pub struct QuotaLedger {
    store: Arc<dyn MetadataStorage>,
    default_group: GroupId,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn MetadataStorage>, default_group: GroupId) -> Self {
        Self { store, default_group }
    }

    /// Users are created lazily on first contact, in the default group.
    pub fn ensure_user(&self, user_id: UserId) -> DriveResult<UserAccount> {
        self.store.ensure_user(user_id, self.default_group, Utc::now())
    }

    pub fn set_group(&self, group: &Group) -> DriveResult<()> {
        self.store.put_group(group)?;
        info!("Stored group {} ({} bytes)", group.name, group.max_storage);
        Ok(())
    }

    pub fn assign_user(&self, user_id: UserId, group_id: GroupId) -> DriveResult<()> {
        if self.store.get_group(group_id)?.is_none() {
            return Err(DriveError::NotFound(format!("group {}", group_id)));
        }
        self.ensure_user(user_id)?;
        self.store.assign_group(user_id, group_id)
    }

    /// Read path for known users; only first contact writes.
    fn account(&self, user_id: UserId) -> DriveResult<UserAccount> {
        match self.store.get_user(user_id)? {
            Some(account) => Ok(account),
            None => self.ensure_user(user_id),
        }
    }

    /// Whether the user's group may upload through `policy_id`.
    pub fn policy_allowed(&self, user_id: UserId, policy_id: PolicyId) -> DriveResult<bool> {
        let account = self.account(user_id)?;
        Ok(self
            .store
            .get_group(account.group_id)?
            .map_or(false, |group| group.policy_ids.contains(&policy_id)))
    }

    /// First policy of the user's group, used by WebDAV uploads.
    pub fn default_policy(&self, user_id: UserId) -> DriveResult<Option<PolicyId>> {
        let account = self.account(user_id)?;
        Ok(self.store.get_group(account.group_id)?.and_then(|g| g.policy_ids.first().copied()))
    }

    pub fn usage(&self, user_id: UserId) -> DriveResult<QuotaUsage> {
        self.ensure_user(user_id)?;
        self.store.quota_usage(user_id)
    }

    /// Reserve `bytes` for `session_id` if they fit under the quota.
    pub fn reserve(&self, user_id: UserId, session_id: &str, bytes: u64, now: DateTime<Utc>) -> DriveResult<QuotaReservation> {
        self.ensure_user(user_id)?;
        let reservation = QuotaReservation {
            session_id: session_id.to_string(),
            user_id,
            bytes,
            created_at: now,
        };
        match self.store.reserve_quota(&reservation) {
            Ok(()) => {
                debug!("Reserved {} bytes for session {}", bytes, session_id);
                Ok(reservation)
            }
            Err(e) => {
                if let DriveError::QuotaExceeded { available, .. } = &e {
                    warn!("User {} asked for {} bytes with {} available", user_id, bytes, available);
                }
                Err(e)
            }
        }
    }

    /// Give a reservation back. Safe to call more than once.
    pub fn release(&self, session_id: &str) -> DriveResult<Option<QuotaReservation>> {
        let released = self.store.release_quota(session_id)?;
        if let Some(reservation) = &released {
            debug!("Released {} bytes of session {}", reservation.bytes, session_id);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::mock_store::MockMetadataStore;

    const MIB: u64 = 1024 * 1024;

    fn ledger(quota: u64) -> QuotaLedger {
        let store = Arc::new(MockMetadataStore::new());
        let ledger = QuotaLedger::new(store, 1);
        ledger
            .set_group(&Group { id: 1, name: "default".into(), max_storage: quota, policy_ids: vec![1, 2] })
            .unwrap();
        ledger
    }

    #[test]
    fn test_reservation_larger_than_remaining_is_rejected() {
        let ledger = ledger(20 * MIB);
        ledger.reserve(1, "warmup", 15 * MIB, Utc::now()).unwrap();

        let err = ledger.reserve(1, "big", 10 * MIB, Utc::now()).unwrap_err();
        assert!(matches!(err, DriveError::QuotaExceeded { required, available } if required == 10 * MIB && available == 5 * MIB));
        assert_eq!(ledger.usage(1).unwrap().reserved, 15 * MIB);
    }

    #[test]
    fn test_release_then_reserve_again() {
        let ledger = ledger(10);
        ledger.reserve(1, "a", 10, Utc::now()).unwrap();
        assert!(ledger.reserve(1, "b", 1, Utc::now()).is_err());
        ledger.release("a").unwrap();
        ledger.release("a").unwrap();
        ledger.reserve(1, "b", 10, Utc::now()).unwrap();
        assert_eq!(ledger.usage(1).unwrap().available(), 0);
    }

    #[test]
    fn test_group_policies() {
        let ledger = ledger(10);
        assert!(ledger.policy_allowed(1, 2).unwrap());
        assert!(!ledger.policy_allowed(1, 3).unwrap());
        assert_eq!(ledger.default_policy(1).unwrap(), Some(1));

        ledger
            .set_group(&Group { id: 2, name: "vip".into(), max_storage: 100, policy_ids: vec![3] })
            .unwrap();
        ledger.assign_user(1, 2).unwrap();
        assert!(ledger.policy_allowed(1, 3).unwrap());
        assert_eq!(ledger.usage(1).unwrap().quota, 100);
        assert!(ledger.assign_user(1, 9).is_err());

        // First contact through a policy check creates the account.
        assert!(ledger.policy_allowed(4, 1).unwrap());
        assert_eq!(ledger.usage(4).unwrap().quota, 10);
    }
}
