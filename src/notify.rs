use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Single-shot notification raised when a stream is closed.
///
/// Callbacks registered before the notification fire run exactly once, on
/// the thread that fires it. Callbacks registered afterwards run
/// immediately on the registering thread.
#[derive(Default)]
pub struct Completion {
    fired: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_fired() {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    /// Receiver resolving once the notification fires. Works both from
    /// async code (`.await`) and blocking code (`blocking_recv`).
    pub fn finished(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.on_finished(move || {
            // the receiver may have been dropped already
            let _ = tx.send(());
        });
        rx
    }

    /// Fires the notification. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        let callbacks = {
            let mut callbacks = self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.fired.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *callbacks)
        };

        for callback in callbacks {
            callback();
        }
        true
    }
}
