//! Single-flight simulation cache
//!
//! [`SingleFlight`] runs at most one construction per key. The first caller
//! spawns it; every caller (including ones arriving before it completes)
//! awaits the same shared future and receives a clone of the same result.
//! Successful results are kept until [`SingleFlight::clear`]; failures are
//! evicted so a later call can retry.

use crate::error::{LayoutError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

#[cfg(feature = "storage")]
use crate::dataset::{DatasetDescriptor, DatasetPipeline};
#[cfg(feature = "storage")]
use crate::simulation::{Simulation, SimulationId};
#[cfg(feature = "storage")]
use std::sync::{Arc, RwLock};

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Keyed single-flight construction
pub struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Flight<V>>>,
}

impl<K, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.flights.lock().map_or(0, |m| m.len());
        f.debug_struct("SingleFlight").field("entries", &len).finish()
    }
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Result for `key`, running `make` only if no flight exists
    ///
    /// Construction runs on its own task, so it completes even if every
    /// caller stops waiting.
    ///
    /// # Errors
    ///
    /// Returns the construction's error (shared by every waiting caller)
    pub async fn get_or_run<F, Fut>(&self, key: K, make: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            flights
                .entry(key.clone())
                .or_insert_with(|| {
                    let task = tokio::spawn(make());
                    async move {
                        task.await.map_err(|e| {
                            LayoutError::InvalidState(format!("construction task failed: {e}"))
                        })?
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        let result = flight.clone().await;
        if result.is_err() {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            if flights.get(&key).is_some_and(|f| f.ptr_eq(&flight)) {
                flights.remove(&key);
            }
        }
        result
    }

    /// Whether a flight (pending or successful) exists for `key`
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of flights
    #[must_use]
    pub fn len(&self) -> usize {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether there are no flights
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every flight; pending constructions finish for their waiters
    pub fn clear(&self) {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Process-wide simulation cache keyed by dataset identity
#[cfg(feature = "storage")]
#[derive(Debug)]
pub struct SimulationRegistry {
    pipeline: Arc<DatasetPipeline>,
    flights: SingleFlight<String, Arc<Simulation>>,
    by_id: RwLock<HashMap<SimulationId, Arc<Simulation>>>,
}

#[cfg(feature = "storage")]
impl SimulationRegistry {
    /// Registry loading through `pipeline`
    #[must_use]
    pub fn new(pipeline: DatasetPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            flights: SingleFlight::new(),
            by_id: RwLock::new(HashMap::new()),
        }
    }

    /// The simulation for `dataset`, loading it at most once
    ///
    /// # Errors
    ///
    /// Returns the load failure; the next call retries
    pub async fn simulation(&self, dataset: DatasetDescriptor) -> Result<Arc<Simulation>> {
        let pipeline = Arc::clone(&self.pipeline);
        let simulation = self
            .flights
            .get_or_run(dataset.key(), move || async move {
                pipeline.load(dataset).await.map(Arc::new)
            })
            .await?;

        self.by_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(simulation.id())
            .or_insert_with(|| Arc::clone(&simulation));
        Ok(simulation)
    }

    /// A resolved simulation by its own id
    #[must_use]
    pub fn by_id(&self, id: SimulationId) -> Option<Arc<Simulation>> {
        self.by_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of resolved simulations
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has resolved
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn reset(&self) {
        self.flights.clear();
        self.by_id.write().unwrap_or_else(PoisonError::into_inner).clear();
        tracing::debug!("simulation registry reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flights: Arc<SingleFlight<&str, Arc<String>>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (flights, runs) = (Arc::clone(&flights), Arc::clone(&runs));
                tokio::spawn(async move {
                    flights
                        .get_or_run("k", move || async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Arc::new("value".to_owned()))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let values = futures::future::join_all(handles).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let first = values[0].as_ref().unwrap();
        for value in &values {
            assert!(Arc::ptr_eq(first, value.as_ref().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_failure_evicted_then_retried() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();

        let err = flights
            .get_or_run(1, || async { Err(LayoutError::dataset("d", "offline")) })
            .await
            .unwrap_err();
        assert!(matches!(err, LayoutError::DatasetResolution { .. }));
        assert!(!flights.contains(&1));

        assert_eq!(flights.get_or_run(1, || async { Ok(7) }).await.unwrap(), 7);
        // Cached: a different constructor is not run
        assert_eq!(flights.get_or_run(1, || async { Ok(8) }).await.unwrap(), 7);
        assert_eq!(flights.len(), 1);

        flights.clear();
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_construction_is_an_error() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let err = flights
            .get_or_run(1, || async {
                if true {
                    panic!("boom");
                }
                Ok(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LayoutError::InvalidState(_)));
    }
}
