//! Progress reporting and the cooperative cancellation channel

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub trait ProgressSink: Send + Sync {
    fn report(&self, text: &str);
    fn increment_counter(&self);
    fn is_canceled(&self) -> bool;
    fn set_canceled(&self);
}

/// Progress sink writing to the `log` facade
#[derive(Default)]
pub struct LogProgress {
    counter: AtomicUsize,
    canceled: AtomicBool,
}

impl LogProgress {
    pub fn counter(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, text: &str) {
        log::info!("{}", text);
    }

    fn increment_counter(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn set_canceled(&self) {
        if !self.canceled.swap(true, Ordering::AcqRel) {
            log::warn!("cancellation requested");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancellation_is_sticky() {
        let progress = LogProgress::default();
        assert!(!progress.is_canceled());
        progress.increment_counter();
        progress.increment_counter();
        progress.set_canceled();
        progress.set_canceled();
        assert!(progress.is_canceled());
        assert_eq!(progress.counter(), 2);
    }
}
