//! Single-flight execution keyed by identity
//!
//! While work for a key is in progress, further requests for that key attach
//! to the same shared future instead of starting the work again. The entry is
//! dropped as soon as the work settles, successfully or not.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type Flight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

pub struct SingleFlight<K, T, E> {
    in_flight: Arc<Mutex<HashMap<K, Flight<T, E>>>>,
}

impl<K, T, E> Clone for SingleFlight<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<K, T, E> Default for SingleFlight<K, T, E> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T, E> SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start()` for `key` unless a run is already in flight, in which
    /// case wait for that run's result instead.
    ///
    /// The run drops its own entry when it settles, even if every caller
    /// stopped waiting for it.
    pub async fn run<F>(&self, key: K, start: F) -> Result<T, E>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, E>>,
    {
        let flight = {
            let mut in_flight = self.lock();
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(key = ?key, "Joining in-flight run");
                    existing.clone()
                }
                None => {
                    let work = start();
                    let map = Arc::clone(&self.in_flight);
                    let settled_key = key.clone();
                    let flight = async move {
                        let result = work.await;
                        lock_map(&map).remove(&settled_key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    /// Number of keys with work in progress
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Flight<T, E>>> {
        lock_map(&self.in_flight)
    }
}

fn lock_map<K, V>(map: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    // The map is never left half-updated, so a poisoned lock is still usable
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_runs_share_one_execution() {
        let flights: SingleFlight<u32, String, String> = SingleFlight::new();
        let starts = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let starts = Arc::clone(&starts);
            handles.push(tokio::spawn(async move {
                flights
                    .run(7, move || {
                        starts.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok("seven".to_string())
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("seven".to_string()));
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_entry_dropped_after_failure() {
        let flights: SingleFlight<u32, u32, String> = SingleFlight::new();

        let first = flights
            .run(1, || async { Err("backend down".to_string()) }.boxed())
            .await;
        assert_eq!(first, Err("backend down".to_string()));
        assert_eq!(flights.in_flight(), 0);

        let second = flights.run(1, || async { Ok(5) }.boxed()).await;
        assert_eq!(second, Ok(5));
    }

    #[tokio::test]
    async fn test_abandoned_run_still_clears_its_entry() {
        let flights: SingleFlight<u32, u32, String> = SingleFlight::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let gave_up = tokio::time::timeout(
            Duration::from_millis(10),
            flights.run(3, move || {
                async move {
                    let _ = release_rx.await;
                    Ok(1)
                }
                .boxed()
            }),
        )
        .await;
        assert!(gave_up.is_err());
        assert_eq!(flights.in_flight(), 1);

        // A later caller joins the abandoned run and sees its result
        release_tx.send(()).unwrap();
        assert_eq!(flights.run(3, || async { Ok(2) }.boxed()).await, Ok(1));
        assert_eq!(flights.in_flight(), 0);

        assert_eq!(flights.run(3, || async { Ok(2) }.boxed()).await, Ok(2));
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flights: SingleFlight<u32, u32, String> = SingleFlight::new();
        let (a, b) = tokio::join!(
            flights.run(1, || async { Ok(1) }.boxed()),
            flights.run(2, || async { Ok(2) }.boxed()),
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
    }
}
