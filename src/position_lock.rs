use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-position write serialization (§5: "single-writer per position id"). Lifecycle,
/// pyramid, and hedge managers each run as independent poll loops and can observe the
/// same position row in the same tick; this keys a lock per `position_id` so their
/// read-modify-write sequences against the store don't interleave. Acquired only around
/// the local store mutation, never across a gateway call, so a slow exchange response
/// from one manager never blocks another manager's unrelated work.
#[derive(Clone, Default)]
pub struct PositionLocks {
    inner: Arc<StdMutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl PositionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, position_id: i64) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().expect("position lock registry poisoned");
        map.entry(position_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, position_id: i64) -> OwnedMutexGuard<()> {
        self.entry(position_id).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_position_id_shares_one_lock() {
        let locks = PositionLocks::new();
        let g1 = locks.acquire(1).await;
        drop(g1);
        let _g2 = locks.acquire(1).await;
    }

    #[tokio::test]
    async fn distinct_position_ids_dont_contend() {
        let locks = PositionLocks::new();
        let _g1 = locks.acquire(1).await;
        let _g2 = locks.acquire(2).await;
    }
}
