use parking_lot::Mutex;

type Closure = Box<dyn FnOnce() + Send>;

struct Entry {
    closure: Closure,
    countdown: u32,
}

/// FIFO of `(closure, countdown)` entries. `defer` pushes a closure with a
/// countdown — typically the in-flight frame count — so destruction is
/// postponed long enough that no in-flight frame could still be referencing
/// the resource. `next_frame` must be called exactly once per rendered
/// frame; `flush` is only for shutdown, after a device-wide wait, and runs
/// every pending closure regardless of countdown.
///
/// Closures must be idempotent with respect to being run once, and must
/// only touch resources that were alive at the time of deferral.
#[derive(Default)]
pub struct DeferredQueue {
    entries: Mutex<Vec<Entry>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&self, countdown: u32, closure: impl FnOnce() + Send + 'static) {
        self.entries.lock().push(Entry {
            closure: Box::new(closure),
            countdown,
        });
    }

    /// Decrements every entry's countdown by one; entries that reach zero
    /// are run and removed. Must be called once per frame — not once per
    /// `defer` call — or countdowns would race ahead of the in-flight
    /// frames they are meant to outlive.
    pub fn next_frame(&self) {
        let ready = {
            let mut entries = self.entries.lock();
            for entry in entries.iter_mut() {
                entry.countdown = entry.countdown.saturating_sub(1);
            }
            let mut ready = Vec::new();
            entries.retain_mut(|entry| {
                if entry.countdown == 0 {
                    // `retain_mut` drops elements in place; pull the closure
                    // out before it would otherwise be discarded unrun.
                    ready.push(std::mem::replace(
                        &mut entry.closure,
                        Box::new(|| {}),
                    ));
                    false
                } else {
                    true
                }
            });
            ready
        };

        for closure in ready {
            closure();
        }
    }

    /// Runs every pending closure immediately, regardless of countdown.
    /// Only valid after a device-wide wait during shutdown.
    pub fn flush(&self) {
        let pending: Vec<Closure> = self
            .entries
            .lock()
            .drain(..)
            .map(|entry| entry.closure)
            .collect();
        for closure in pending {
            closure();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn countdown_reaches_zero_within_in_flight_frames() {
        let queue = DeferredQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        queue.defer(2, move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(queue.pending_count(), 1);
        queue.next_frame();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_count(), 1);

        queue.next_frame();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn flush_runs_everything_regardless_of_countdown() {
        let queue = DeferredQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran_clone = ran.clone();
            queue.defer(3, move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.flush();
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn zero_countdown_resolves_on_first_next_frame() {
        let queue = DeferredQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        queue.defer(1, move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        queue.next_frame();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
