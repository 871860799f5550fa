//! Response handler that records deliveries.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use brokerframe::{BrokerError, ResponseHandler, ResponseItem};

use crate::messages::number;

/// Cloneable handler storing every delivered item.
#[derive(Clone, Default)]
pub struct CollectingHandler {
    items: Arc<Mutex<Vec<ResponseItem>>>,
}

impl CollectingHandler {
    /// Create an empty handler.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Snapshot of every delivered item.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn items(&self) -> Vec<ResponseItem> { self.items.lock().expect("lock").clone() }

    /// Sequence numbers of delivered responses, errors skipped.
    #[must_use]
    pub fn numbers(&self) -> Vec<u32> {
        self.items()
            .iter()
            .filter(|item| item.error().is_none())
            .map(number)
            .collect()
    }

    /// Errors delivered in place of responses.
    #[must_use]
    pub fn errors(&self) -> Vec<BrokerError> {
        self.items()
            .iter()
            .filter_map(|item| item.error().cloned())
            .collect()
    }

    /// Positions of items flagged as the last response.
    #[must_use]
    pub fn last_positions(&self) -> Vec<usize> {
        self.items()
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_last())
            .map(|(index, _)| index)
            .collect()
    }

    /// Wait until at least `count` items were delivered.
    ///
    /// Returns `false` if `limit` elapsed first.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while self.items.lock().expect("lock").len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl ResponseHandler for CollectingHandler {
    fn on_response(&self, item: ResponseItem) { self.items.lock().expect("lock").push(item); }
}
