//! In-process admission control for checkout. Serialises attempts for the
//! same logical purchase and caps the number running at once. Database row
//! locks stay authoritative; this only keeps duplicate clicks from racing.

use crate::errors::ServiceError;
use dashmap::DashMap;
use metrics::counter;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore},
    time::{timeout_at, Instant},
};
use tracing::debug;

/// One logical purchase: the destination account, the product and the
/// game server (empty when the product has none).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PurchaseKey {
    pub account_id: String,
    pub product: String,
    pub server: String,
}

impl PurchaseKey {
    pub fn new(account_id: &str, product: &str, server: Option<&str>) -> Self {
        Self {
            account_id: account_id.trim().to_string(),
            product: product.trim().to_string(),
            server: server.unwrap_or_default().trim().to_string(),
        }
    }
}

impl fmt::Display for PurchaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.account_id, self.product, self.server)
    }
}

type LockMap = DashMap<PurchaseKey, Arc<Mutex<()>>>;

#[derive(Clone)]
pub struct PurchaseLocks {
    locks: Arc<LockMap>,
    permits: Arc<Semaphore>,
    wait: Duration,
}

impl PurchaseLocks {
    pub fn new(max_concurrent: usize, wait: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            wait,
        }
    }

    /// Waits at most the configured time for both a global slot and the
    /// per-purchase lock.
    pub async fn acquire(&self, key: PurchaseKey) -> Result<PurchaseGuard, ServiceError> {
        let deadline = Instant::now() + self.wait;

        let permit = match timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ServiceError::InternalError(
                    "purchase limiter closed".to_string(),
                ))
            }
            Err(_) => {
                counter!("topup_checkout.lock_timeouts", 1, "scope" => "global");
                return Err(ServiceError::PurchaseInProgress(
                    "too many purchases in flight, try again".to_string(),
                ));
            }
        };

        let mutex = Arc::clone(&*self.locks.entry(key.clone()).or_default());
        let guard = match timeout_at(deadline, mutex.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                counter!("topup_checkout.lock_timeouts", 1, "scope" => "purchase");
                self.locks
                    .remove_if(&key, |_, m| Arc::strong_count(m) == 1);
                return Err(ServiceError::PurchaseInProgress(key.to_string()));
            }
        };

        debug!(%key, "purchase lock acquired");
        Ok(PurchaseGuard {
            key,
            locks: Arc::clone(&self.locks),
            _guard: Some(guard),
            _permit: permit,
        })
    }

    /// Number of purchase keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}

impl fmt::Debug for PurchaseLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurchaseLocks")
            .field("tracked", &self.locks.len())
            .field("available", &self.permits.available_permits())
            .field("wait", &self.wait)
            .finish()
    }
}

/// Held for the duration of a checkout.
#[derive(Debug)]
pub struct PurchaseGuard {
    key: PurchaseKey,
    locks: Arc<LockMap>,
    _guard: Option<OwnedMutexGuard<()>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PurchaseGuard {
    fn drop(&mut self) {
        self._guard.take();
        // Drop the entry once no one else holds or waits on it.
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}
