//! Background thread ownership: a cancellation token plus a blocking join.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const TICK: Duration = Duration::from_millis(10);

/// Sleeps up to `timeout`, waking early when `token` is cancelled.
/// Returns `true` if the token was cancelled.
pub(crate) fn wait_cancelled(token: &CancellationToken, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if token.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(TICK.min(deadline - now));
    }
}

/// A set of named OS threads sharing one cancellation token.
pub(crate) struct TaskGroup {
    name: String,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub(crate) fn spawn<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let token = self.token.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, self.handles.len()))
            .spawn(move || f(token))
            .map_err(|e| Error::resource(format!("spawn {} thread: {e}", self.name)))?;
        self.handles.push(handle);
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Blocks until every thread exits. Calling it again is a no-op.
    pub(crate) fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("{} thread panicked", self.name);
            }
        }
    }

    /// Cancels and joins.
    pub(crate) fn shutdown(&mut self) {
        self.cancel();
        self.join();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_wait_cancelled_times_out() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!wait_cancelled(&token, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_cancelled_wakes_early() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });
        let start = Instant::now();
        assert!(wait_cancelled(&token, Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_group_shutdown_joins_all() {
        let exited = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new("test");
        for _ in 0..3 {
            let exited = exited.clone();
            group
                .spawn(move |token| {
                    while !wait_cancelled(&token, Duration::from_millis(5)) {}
                    exited.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        group.shutdown();
        group.join();
        assert!(group.is_empty());
        assert_eq!(exited.load(Ordering::SeqCst), 3);
    }
}
