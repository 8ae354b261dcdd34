//! Trailing-edge call coalescing.
//!
//! Every call to [`Debouncer::settle`] waits out the window. Only the last
//! caller of a burst gets `true`; everyone superseded during the wait gets
//! `false` and should skip the work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct Debouncer {
    window: Duration,
    generation: AtomicU64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            generation: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn settle(&self) -> bool {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.window).await;
        self.generation.load(Ordering::SeqCst) == ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_last_call() {
        let debouncer = Arc::new(Debouncer::new(Duration::from_millis(300)));
        let mut handles = Vec::new();
        for i in 0..5u64 {
            let d = Arc::clone(&debouncer);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i * 50)).await;
                d.settle().await
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert_eq!(results, vec![false, false, false, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_outside_window_all_run() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        assert!(debouncer.settle().await);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(debouncer.settle().await);
    }
}
