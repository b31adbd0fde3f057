//! Leading + trailing throttle.
//!
//! The first call fires immediately and opens a window of `interval`. Calls
//! made while the window is open overwrite one stored trailing value. When
//! the window closes the trailing value (if any) fires and a new window
//! opens; otherwise the throttle goes idle. So at most one emission happens
//! per interval and the last value of a burst is always emitted.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Rate limiter in front of an emit function.
pub struct Throttle<T> {
    inner: Arc<ThrottleInner<T>>,
}

struct ThrottleInner<T> {
    interval: Duration,
    emit: Box<dyn Fn(T) + Send + Sync>,
    state: Mutex<WindowState<T>>,
    runtime: Handle,
}

struct WindowState<T> {
    open: bool,
    trailing: Option<T>,
    timer: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Throttle<T> {
    /// Must be called inside a tokio runtime; window timers run on it even
    /// when `call` comes from another thread.
    pub fn new<F>(interval: Duration, emit: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ThrottleInner {
                interval,
                emit: Box::new(emit),
                state: Mutex::new(WindowState {
                    open: false,
                    trailing: None,
                    timer: None,
                }),
                runtime: Handle::current(),
            }),
        }
    }

    pub fn call(&self, value: T) {
        let mut state = self.inner.lock_state();
        if state.open {
            trace!("throttle window open, storing trailing value");
            state.trailing = Some(value);
            return;
        }

        state.open = true;
        let inner = Arc::clone(&self.inner);
        state.timer = Some(self.inner.runtime.spawn(run_window(inner)));
        drop(state);

        (self.inner.emit)(value);
    }

    /// Drop any trailing value and close the window.
    pub fn cancel(&self) {
        let mut state = self.inner.lock_state();
        state.trailing = None;
        state.open = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// True while a window is open.
    pub fn is_active(&self) -> bool {
        self.inner.lock_state().open
    }
}

impl<T> Clone for Throttle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ThrottleInner<T> {
    fn lock_state(&self) -> MutexGuard<'_, WindowState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_window<T>(inner: Arc<ThrottleInner<T>>) {
    loop {
        tokio::time::sleep(inner.interval).await;

        let mut state = inner.lock_state();
        match state.trailing.take() {
            Some(value) => {
                drop(state);
                trace!("throttle trailing edge");
                (inner.emit)(value);
            }
            None => {
                state.open = false;
                state.timer = None;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn recording() -> (Throttle<u32>, Arc<Mutex<Vec<u32>>>) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let throttle = Throttle::new(INTERVAL, move |value| sink.lock().unwrap().push(value));
        (throttle, emitted)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_call_fires_once() {
        let (throttle, emitted) = recording();

        throttle.call(1);
        assert_eq!(*emitted.lock().unwrap(), vec![1]);

        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(*emitted.lock().unwrap(), vec![1]);
        assert!(!throttle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_fires_leading_and_latest_trailing() {
        let (throttle, emitted) = recording();

        for value in 1..=5 {
            throttle.call(value);
        }
        assert_eq!(*emitted.lock().unwrap(), vec![1]);

        tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(*emitted.lock().unwrap(), vec![1, 5]);

        tokio::time::sleep(INTERVAL * 2).await;
        assert_eq!(*emitted.lock().unwrap(), vec![1, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_emission_per_interval() {
        let (throttle, emitted) = recording();

        // 10ms apart for one second.
        for value in 0..100 {
            throttle.call(value);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(INTERVAL * 2).await;

        let emitted = emitted.lock().unwrap();
        assert!(emitted.len() <= 11, "too many emissions: {}", emitted.len());
        assert_eq!(emitted.first(), Some(&0));
        assert_eq!(emitted.last(), Some(&99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_calls_each_lead() {
        let (throttle, emitted) = recording();

        throttle.call(1);
        tokio::time::sleep(INTERVAL * 2).await;
        throttle.call(2);
        tokio::time::sleep(INTERVAL * 2).await;

        assert_eq!(*emitted.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_trailing_value() {
        let (throttle, emitted) = recording();

        throttle.call(1);
        throttle.call(2);
        throttle.cancel();
        tokio::time::sleep(INTERVAL * 2).await;

        assert_eq!(*emitted.lock().unwrap(), vec![1]);
        assert!(!throttle.is_active());
    }
}
