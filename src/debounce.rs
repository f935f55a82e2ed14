//! Trailing-edge debouncer.
//!
//! Each debouncer is a worker task that solely owns its timer and the most
//! recent value; callers only send `Eval` messages through the handle. When
//! the interval elapses with no new message, the last value is forwarded to
//! the settled channel and the timer clears. Keeping the timer behind a
//! single task makes concurrent calls race-free by construction.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use crate::clock::OneShot;

/// Caller-side handle. Cheap to clone; dropping every handle stops the
/// worker and discards any pending value.
#[derive(Debug, Clone)]
pub struct DebounceHandle<T> {
    eval_tx: mpsc::UnboundedSender<T>,
}

impl<T> DebounceHandle<T> {
    /// Submit a value: starts the timer if idle, resets it otherwise. The
    /// most recent value wins when the timer finally fires.
    pub fn call(&self, value: T) {
        // A closed worker means shutdown; losing the value is fine then.
        let _ = self.eval_tx.send(value);
    }
}

/// Spawn a debouncer worker forwarding settled values to `settled_tx`.
pub fn spawn<T: Send + 'static>(
    interval: Duration,
    settled_tx: mpsc::Sender<T>,
) -> DebounceHandle<T> {
    let (eval_tx, mut eval_rx) = mpsc::unbounded_channel::<T>();

    tokio::spawn(async move {
        let mut timer = OneShot::disarmed();
        let mut last: Option<T> = None;

        loop {
            tokio::select! {
                maybe = eval_rx.recv() => match maybe {
                    Some(value) => {
                        trace!(interval = ?interval, "debounce reset");
                        last = Some(value);
                        timer.arm(interval);
                    }
                    None => break,
                },
                _ = timer.fired(), if timer.is_armed() => {
                    timer.clear();
                    if let Some(value) = last.take() {
                        trace!("debounce settled");
                        if settled_tx.send(value).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    DebounceHandle { eval_tx }
}
