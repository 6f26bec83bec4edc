use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::proto::primitives::PaymentHash;

/// Serializes channel provisioning per payment hash.
///
/// Entries are held weakly; a hash's lock lives only as long as someone
/// holds or waits for it.
#[derive(Debug, Default)]
pub struct ProvisionLocks {
    locks: Mutex<HashMap<PaymentHash, Weak<Mutex<()>>>>,
}

impl ProvisionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, payment_hash: &PaymentHash) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            match map.get(payment_hash).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    map.retain(|_, weak| weak.strong_count() > 0);
                    log::debug!("Creating provisioning lock for payment_hash={}", payment_hash);
                    let lock = Arc::new(Mutex::new(()));
                    map.insert(*payment_hash, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn live_entries(&self) -> usize {
        self.locks
            .lock()
            .await
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
