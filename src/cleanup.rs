//! Ordered list of cleanup actions bound to a parcel. Actions run in the
//! order they were added, when the owning parcel is dropped.

pub struct Cleanup {
    items: Vec<Box<dyn FnOnce() + Send>>,
}

impl Cleanup {
    pub fn new() -> Self {
        Cleanup { items: Vec::new() }
    }

    pub fn add<F: FnOnce() + Send + 'static>(&mut self, action: F) {
        self.items.push(Box::new(action));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Runs all pending actions now, leaving the list empty.
    pub fn reset(&mut self) {
        for item in self.items.drain(..) {
            item();
        }
    }
}

impl Default for Cleanup {
    fn default() -> Self {
        Cleanup::new()
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_in_append_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut cleanup = Cleanup::new();
        for i in 0..3 {
            let order = order.clone();
            cleanup.add(move || order.lock().unwrap().push(i));
        }
        drop(cleanup);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn reset_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut cleanup = Cleanup::new();
        let c = count.clone();
        cleanup.add(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        cleanup.reset();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(cleanup);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
