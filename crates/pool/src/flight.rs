//! Single-flight execution: at most one attempt of an operation runs at a
//! time and every concurrent caller receives that attempt's outcome.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::error::PoolError;

type Attempt<T> = Shared<BoxFuture<'static, Result<T, PoolError>>>;

enum FlightState<T> {
    Idle,
    InFlight(Attempt<T>),
    Done(T),
}

/// A success is remembered forever; a failure returns the flight to idle so
/// the next caller starts a fresh attempt.
pub struct SingleFlight<T> {
    state: Arc<Mutex<FlightState<T>>>,
    attempts: AtomicUsize,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FlightState::Idle)),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Join the attempt in flight, or start one with `start`. `start` is only
    /// invoked when no attempt is running and none has succeeded.
    pub async fn run<F, Fut>(&self, start: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PoolError>> + Send + 'static,
    {
        let attempt = {
            let mut state = lock(&self.state);
            match &*state {
                FlightState::Done(value) => return Ok(value.clone()),
                FlightState::InFlight(attempt) => attempt.clone(),
                FlightState::Idle => {
                    self.attempts.fetch_add(1, Ordering::Relaxed);
                    let attempt = launch(Arc::clone(&self.state), start());
                    *state = FlightState::InFlight(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    pub fn is_done(&self) -> bool {
        matches!(*lock(&self.state), FlightState::Done(_))
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(*lock(&self.state), FlightState::InFlight(_))
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The attempt runs as its own task so it finishes even if every caller
/// stops waiting.
fn launch<T, Fut>(state: Arc<Mutex<FlightState<T>>>, work: Fut) -> Attempt<T>
where
    T: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, PoolError>> + Send + 'static,
{
    let settle = Arc::clone(&state);
    let task = tokio::spawn(async move {
        let outcome = work.await;
        *lock(&settle) = match &outcome {
            Ok(value) => FlightState::Done(value.clone()),
            Err(_) => FlightState::Idle,
        };
        outcome
    });
    task.map(move |joined| {
        joined.unwrap_or_else(|err| {
            *lock(&state) = FlightState::Idle;
            Err(PoolError::Runtime(format!("attempt aborted: {err}")))
        })
    })
    .boxed()
    .shared()
}

fn lock<T>(state: &Mutex<FlightState<T>>) -> MutexGuard<'_, FlightState<T>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut callers = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            callers.push(tokio::spawn(async move {
                flight
                    .run(|| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(7)
                    })
                    .await
            }));
        }

        while !flight.is_in_flight() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), Ok(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.attempts(), 1);
        assert!(flight.is_done());
    }

    #[tokio::test]
    async fn test_failure_allows_retry() {
        let flight = SingleFlight::<bool>::new();
        let err = flight
            .run(|| async { Err(PoolError::Transport("offline".to_string())) })
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::Transport("offline".to_string()));
        assert!(!flight.is_done());

        assert_eq!(flight.run(|| async { Ok(true) }).await, Ok(true));
        assert_eq!(flight.attempts(), 2);

        // Done: the closure is never called again.
        let value = flight
            .run(|| async { panic!("must not start another attempt") })
            .await;
        assert_eq!(value, Ok(true));
        assert_eq!(flight.attempts(), 2);
    }
}
