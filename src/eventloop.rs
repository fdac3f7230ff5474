//! The event thread.
//!
//! Application transaction handlers run on a single, well-known thread,
//! never on a looper. By default that thread is spawned lazily here; an
//! application that has its own main loop can install a dispatcher instead
//! (before the first binder use) and run the posted callbacks wherever it
//! wants, as long as it runs them in order on one thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use log::debug;

pub trait EventDispatcher: Send + Sync {
    /// Queues a callback to run on the event thread, in posting order.
    fn post(&self, callback: Box<dyn FnOnce() + Send>);
}

struct DefaultDispatcher {
    sender: Mutex<mpsc::Sender<Box<dyn FnOnce() + Send>>>,
}

impl EventDispatcher for DefaultDispatcher {
    fn post(&self, callback: Box<dyn FnOnce() + Send>) {
        // A send error means process teardown; drop the callback
        let _ = self.sender.lock().unwrap().send(callback);
    }
}

static DISPATCHER: Mutex<Option<Arc<dyn EventDispatcher>>> = Mutex::new(None);

fn dispatcher() -> Arc<dyn EventDispatcher> {
    let mut dispatcher = DISPATCHER.lock().unwrap();
    match dispatcher.as_ref() {
        Some(d) => d.clone(),
        None => {
            let (sender, receiver) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
            thread::Builder::new()
                .name("binder-event".to_string())
                .spawn(move || {
                    debug!("Event thread running");
                    while let Ok(callback) = receiver.recv() {
                        callback();
                    }
                    debug!("Event thread done");
                })
                .expect("failed to spawn the event thread");
            let d: Arc<dyn EventDispatcher> = Arc::new(DefaultDispatcher {
                sender: Mutex::new(sender),
            });
            *dispatcher = Some(d.clone());
            d
        }
    }
}

/// Installs an application dispatcher. Must happen before the first binder
/// use; the default event thread is spawned on demand otherwise.
pub fn set_dispatcher(custom: Arc<dyn EventDispatcher>) {
    *DISPATCHER.lock().unwrap() = Some(custom);
}

/// Posts a callback to the event thread.
pub(crate) fn post<F: FnOnce() + Send + 'static>(callback: F) {
    dispatcher().post(Box::new(callback));
}

/// Handle to a posted callback that can still be withdrawn.
pub(crate) struct IdleCallback {
    cancelled: AtomicBool,
}

impl IdleCallback {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Posts a callback that is skipped if cancelled before it runs.
pub(crate) fn post_cancellable<F: FnOnce() + Send + 'static>(callback: F)
    -> Arc<IdleCallback> {
    let handle = Arc::new(IdleCallback { cancelled: AtomicBool::new(false) });
    let posted = handle.clone();
    post(move || {
        if !posted.cancelled.load(Ordering::SeqCst) {
            callback();
        }
    });
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn posts_run_in_order() {
        let (tx, rx) = channel();
        for i in 0..4 {
            let tx = tx.clone();
            post(move || {
                let _ = tx.send(i);
            });
        }
        let received: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancelled_callback_is_skipped() {
        let (tx, rx) = channel();
        let blocker = channel::<()>();
        // Hold the event thread so the cancel lands first
        let hold = blocker.1;
        post(move || {
            let _ = hold.recv_timeout(Duration::from_secs(5));
        });
        let cancelled = {
            let tx = tx.clone();
            post_cancellable(move || {
                let _ = tx.send("cancelled");
            })
        };
        cancelled.cancel();
        post(move || {
            let _ = tx.send("after");
        });
        let _ = blocker.0.send(());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "after");
    }
}
