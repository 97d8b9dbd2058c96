//! Process-local request coalescer: a `fingerprint -> shared future` map,
//! built the way the teacher models "notify all subscribers exactly once"
//! (`active_requests: DashMap<CacheKey, watch::Receiver<bool>>` plus
//! `dashmap::Entry::Occupied`/`Vacant` check-and-insert in `app.rs`) rather
//! than a bespoke once-cell/condvar pair.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub enum CoalesceError<E> {
    Producer(E),
    Timeout,
}

pub struct Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    in_flight: DashMap<String, watch::Receiver<Option<Result<T, CoalesceError<E>>>>>,
    enabled: bool,
    timeout: Duration,
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            in_flight: DashMap::new(),
            enabled,
            timeout,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the result alongside whether this call rode an existing
    /// fetch rather than starting one (i.e. was coalesced).
    pub async fn get_or_fetch<F, Fut>(
        &self,
        fingerprint: &str,
        producer: F,
    ) -> (Result<T, CoalesceError<E>>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.enabled {
            return (self.run_producer(producer).await, false);
        }

        // `Err(tx)` on a miss keeps the sender alive across the producer
        // call; dropping it early would make every subscriber's
        // `changed()` resolve to "sender gone" before the fetch even runs.
        let slot = match self.in_flight.entry(fingerprint.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                Err(tx)
            }
        };

        match slot {
            Ok(mut rx) => {
                let result = wait_for_result(&mut rx).await;
                (result, true)
            }
            Err(tx) => {
                let result = self.run_producer(producer).await;
                // remove before notifying: a new miss arriving the instant
                // after completion must start its own fetch, not subscribe
                // to one that is already finished and gone.
                self.in_flight.remove(fingerprint);
                let _ = tx.send(Some(result.clone()));
                (result, false)
            }
        }
    }

    async fn run_producer<F, Fut>(&self, producer: F) -> Result<T, CoalesceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.timeout, producer()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CoalesceError::Producer(err)),
            Err(_) => Err(CoalesceError::Timeout),
        }
    }
}

async fn wait_for_result<T, E>(
    rx: &mut watch::Receiver<Option<Result<T, CoalesceError<E>>>>,
) -> Result<T, CoalesceError<E>>
where
    T: Clone,
    E: Clone,
{
    loop {
        if let Some(result) = rx.borrow().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            // sender dropped without ever sending: the producer's task
            // itself was aborted, not a normal timeout/error completion.
            return Err(CoalesceError::Timeout);
        }
    }
}
