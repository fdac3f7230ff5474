//! Per-device object tables: pointer to local object, handle to remote
//! proxy. Entries are weak; a map never keeps an object alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::warn;

use crate::ipc::Ipc;
use crate::object::{LocalObject, RemoteObject};

/// Whether get_remote may create a missing proxy, and whether the created
/// proxy takes kernel references right away (the case for handles decoded
/// out of a parcel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteLookup {
    DontCreate,
    Create,
    CreateAndAcquire,
}

pub struct ObjectRegistry {
    ipc: Mutex<Weak<Ipc>>,
    locals: Mutex<HashMap<u64, Weak<LocalObject>>>,
    remotes: Mutex<HashMap<u32, Weak<RemoteObject>>>,
}

impl ObjectRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ObjectRegistry {
            ipc: Mutex::new(Weak::new()),
            locals: Mutex::new(HashMap::new()),
            remotes: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn set_ipc(&self, ipc: &Arc<Ipc>) {
        *self.ipc.lock().unwrap() = Arc::downgrade(ipc);
    }

    pub(crate) fn register_local(&self, obj: &Arc<LocalObject>) {
        self.locals.lock().unwrap().insert(obj.raw_ptr(), Arc::downgrade(obj));
    }

    /// Returns an owned reference to the local object the kernel addressed,
    /// or None (with a warning) for an unknown pointer.
    pub fn get_local(&self, ptr: u64) -> Option<Arc<LocalObject>> {
        if ptr == 0 {
            return None;
        }
        let mut locals = self.locals.lock().unwrap();
        match locals.get(&ptr).and_then(Weak::upgrade) {
            Some(obj) => Some(obj),
            None => {
                locals.remove(&ptr);
                warn!("Unknown local object 0x{:x}", ptr);
                None
            }
        }
    }

    /// Returns the one proxy for `handle`, creating it under the lock when
    /// allowed. Two lookups of the same live handle always return the same
    /// object.
    pub fn get_remote(&self, handle: u32, lookup: RemoteLookup)
        -> Option<Arc<RemoteObject>> {
        let mut remotes = self.remotes.lock().unwrap();
        if let Some(obj) = remotes.get(&handle).and_then(Weak::upgrade) {
            return Some(obj);
        }
        remotes.remove(&handle);
        if lookup == RemoteLookup::DontCreate {
            return None;
        }
        let ipc = self.ipc.lock().unwrap().clone();
        let obj = RemoteObject::new(&ipc, handle,
            lookup == RemoteLookup::CreateAndAcquire);
        remotes.insert(handle, Arc::downgrade(&obj));
        Some(obj)
    }

    /// Called from LocalObject::drop. Removes the entry unless the slot was
    /// already reused by a newer registration.
    pub(crate) fn local_disposed(&self, ptr: u64) {
        let mut locals = self.locals.lock().unwrap();
        if let Some(entry) = locals.get(&ptr) {
            if entry.upgrade().is_none() {
                locals.remove(&ptr);
            }
        }
    }

    pub(crate) fn remote_disposed(&self, handle: u32) {
        let mut remotes = self.remotes.lock().unwrap();
        if let Some(entry) = remotes.get(&handle) {
            if entry.upgrade().is_none() {
                remotes.remove(&handle);
            }
        }
    }

    /// Owned references to every live local object; used for teardown.
    pub(crate) fn live_locals(&self) -> Vec<Arc<LocalObject>> {
        self.locals.lock().unwrap().values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
