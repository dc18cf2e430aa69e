//! Observer Bus (§4.7): fan-out of status/progress events to UI,
//! notifications, and analytics collaborators. Thin by design — the core
//! decides *when* to notify; what an observer does with the event is its
//! own business, entirely outside the core.

use std::sync::{Arc, RwLock};

use crate::record::JobRecord;

/// One observer callback surface. Implementations must not panic; any error
/// returned is logged (`ObserverCallbackFailed`) and never propagated back
/// into engine state.
pub trait Observer: Send + Sync {
    fn update_active_ui(&self, _record: &JobRecord) {}
    fn add_new_active_ui(&self, _record: &JobRecord, _position: usize) {}
    fn update_notification(&self, _record: &JobRecord) {}
    fn on_finish(&self, _record: &JobRecord) {}
    /// Progress text during the cold-start scan, before any job is active.
    fn on_cold_start_progress(&self, _scanned: usize, _total: usize) {}
}

/// Fan-out bus holding every registered observer. Dispatch is best-effort:
/// one observer panicking or erroring never stops delivery to the rest.
#[derive(Default, Clone)]
pub struct ObserverBus {
    observers: Arc<RwLock<Vec<Arc<dyn Observer>>>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.observers.write().unwrap().push(observer);
    }

    pub fn update_active_ui(&self, record: &JobRecord) {
        self.dispatch(|o| o.update_active_ui(record));
    }

    pub fn add_new_active_ui(&self, record: &JobRecord, position: usize) {
        self.dispatch(|o| o.add_new_active_ui(record, position));
    }

    pub fn update_notification(&self, record: &JobRecord) {
        self.dispatch(|o| o.update_notification(record));
    }

    pub fn on_finish(&self, record: &JobRecord) {
        self.dispatch(|o| o.on_finish(record));
    }

    pub fn on_cold_start_progress(&self, scanned: usize, total: usize) {
        self.dispatch(|o| o.on_cold_start_progress(scanned, total));
    }

    fn dispatch(&self, call: impl Fn(&Arc<dyn Observer>)) {
        let observers = self.observers.read().unwrap();
        for observer in observers.iter() {
            let observer = Arc::clone(observer);
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| call(&observer)));
            if result.is_err() {
                tracing::warn!("observer callback panicked, dropping its notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        finishes: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn on_finish(&self, _record: &JobRecord) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingObserver;
    impl Observer for PanickingObserver {
        fn on_finish(&self, _record: &JobRecord) {
            panic!("boom");
        }
    }

    fn sample() -> JobRecord {
        JobRecord::new_waiting(
            "job-1".into(),
            "https://example.com/f.bin".into(),
            "/tmp/f.bin".into(),
            "f.bin".into(),
            "/tmp".into(),
            GlobalSettings::default(),
            0,
        )
    }

    #[test]
    fn dispatch_reaches_every_registered_observer() {
        let bus = ObserverBus::new();
        let counter = Arc::new(CountingObserver {
            finishes: AtomicUsize::new(0),
        });
        bus.register(counter.clone());
        bus.register(counter.clone());
        bus.on_finish(&sample());
        assert_eq!(counter.finishes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_observer_does_not_stop_the_rest() {
        let bus = ObserverBus::new();
        let counter = Arc::new(CountingObserver {
            finishes: AtomicUsize::new(0),
        });
        bus.register(Arc::new(PanickingObserver));
        bus.register(counter.clone());
        bus.on_finish(&sample());
        assert_eq!(counter.finishes.load(Ordering::SeqCst), 1);
    }
}
