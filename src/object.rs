//! Local objects published to the kernel and proxies for remote ones.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::io::Io;
use crate::ipc::Ipc;
use crate::protocol::RpcProtocol;
use crate::reply::{LocalReply, RemoteReply};
use crate::request::{LocalRequest, RemoteRequest};
use crate::sys::TxFlags;
use crate::{STATUS_DEAD_OBJECT, STATUS_OK};

/// How an incoming transaction is routed to a local object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSupport {
    /// Runs on the event thread through the Handler.
    Supported,
    /// Framework probe handled inline on the looper thread.
    Looper,
    NotSupported,
}

pub type TransactFn = dyn Fn(&Arc<LocalObject>, &mut RemoteRequest, u32, TxFlags)
    -> (Option<LocalReply>, i32) + Send + Sync;

/// An object of ours, addressable by the kernel. The kernel's strong
/// references keep the object alive: while `strong_refs > 0` the object
/// holds a reference to itself, released again by BR_RELEASE.
pub struct LocalObject {
    ipc: Weak<Ipc>,
    io: &'static dyn Io,
    ifaces: Vec<String>,
    handler: Box<TransactFn>,
    strong_refs: AtomicUsize,
    weak_refs: AtomicUsize,
    keepalive: Mutex<Option<Arc<LocalObject>>>,
}

impl LocalObject {
    /// Creates and publishes a local object. Registration makes sure at
    /// least one primary looper is running.
    pub fn new<F>(ipc: &Arc<Ipc>, ifaces: &[&str], handler: F) -> Arc<LocalObject>
    where
        F: Fn(&Arc<LocalObject>, &mut RemoteRequest, u32, TxFlags)
            -> (Option<LocalReply>, i32) + Send + Sync + 'static,
    {
        let obj = Arc::new(LocalObject {
            ipc: Arc::downgrade(ipc),
            io: ipc.io(),
            ifaces: ifaces.iter().map(|s| s.to_string()).collect(),
            handler: Box::new(handler),
            strong_refs: AtomicUsize::new(0),
            weak_refs: AtomicUsize::new(0),
            keepalive: Mutex::new(None),
        });
        ipc.register_local_object(&obj);
        obj
    }

    /// An unpublished object for exercising the transaction machinery
    /// without a binder device.
    #[cfg(test)]
    pub(crate) fn for_test<F>(ifaces: &[&str], handler: F) -> Arc<LocalObject>
    where
        F: Fn(&Arc<LocalObject>, &mut RemoteRequest, u32, TxFlags)
            -> (Option<LocalReply>, i32) + Send + Sync + 'static,
    {
        Arc::new(LocalObject {
            ipc: Weak::new(),
            io: &crate::io::IO64,
            ifaces: ifaces.iter().map(|s| s.to_string()).collect(),
            handler: Box::new(handler),
            strong_refs: AtomicUsize::new(0),
            weak_refs: AtomicUsize::new(0),
            keepalive: Mutex::new(None),
        })
    }

    /// The registry key; this is what the kernel gets in flat objects and
    /// hands back as the transaction target.
    pub fn raw_ptr(&self) -> u64 {
        self as *const LocalObject as u64
    }

    pub fn ifaces(&self) -> &[String] {
        &self.ifaces
    }

    pub fn strong_refs(&self) -> usize {
        self.strong_refs.load(Ordering::SeqCst)
    }

    pub(crate) fn classify(&self, iface: Option<&str>, code: u32,
        protocol: &'static dyn RpcProtocol) -> TransactionSupport {
        if code == protocol.ping_tx() ||
            Some(code) == protocol.interface_request_tx() {
            return TransactionSupport::Looper;
        }
        match iface {
            Some(iface) if self.ifaces.iter().any(|i| i == iface) =>
                TransactionSupport::Supported,
            _ => TransactionSupport::NotSupported,
        }
    }

    pub(crate) fn handle_transaction(self: &Arc<Self>, req: &mut RemoteRequest,
        code: u32, flags: TxFlags) -> (Option<LocalReply>, i32) {
        (self.handler)(self, req, code, flags)
    }

    /// Framework probes are answered inline on the looper thread.
    pub(crate) fn handle_looper_transaction(self: &Arc<Self>,
        _req: &mut RemoteRequest, code: u32,
        protocol: &'static dyn RpcProtocol) -> (Option<LocalReply>, i32) {
        if code == protocol.ping_tx() {
            (Some(LocalReply::new(self.io)), STATUS_OK)
        } else if Some(code) == protocol.interface_request_tx() {
            let mut reply = LocalReply::new(self.io);
            {
                let mut writer = reply.writer();
                writer.append_u32(0);
                writer.append_string16(self.ifaces.first().map(|s| s.as_str()));
            }
            (Some(reply), STATUS_OK)
        } else {
            (None, STATUS_OK)
        }
    }

    pub(crate) fn handle_increfs(&self) {
        self.weak_refs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn handle_decrefs(&self) {
        let prev = self.weak_refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "weak refcount underflow");
    }

    pub(crate) fn handle_acquire(self: &Arc<Self>) {
        if self.strong_refs.fetch_add(1, Ordering::SeqCst) == 0 {
            *self.keepalive.lock().unwrap() = Some(self.clone());
        }
    }

    pub(crate) fn handle_release(&self) {
        let prev = self.strong_refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "strong refcount underflow");
        if prev == 1 {
            // May drop the last application-visible reference
            let released = self.keepalive.lock().unwrap().take();
            drop(released);
        }
    }

    /// Forcibly releases refs held on behalf of the kernel; used during
    /// process teardown when no BR_RELEASE will ever arrive.
    pub(crate) fn drop_kernel_refs(&self) {
        self.strong_refs.store(0, Ordering::SeqCst);
        self.weak_refs.store(0, Ordering::SeqCst);
        let released = self.keepalive.lock().unwrap().take();
        drop(released);
    }
}

impl Drop for LocalObject {
    fn drop(&mut self) {
        if let Some(ipc) = self.ipc.upgrade() {
            ipc.registry().local_disposed(self.raw_ptr());
        }
    }
}

/// Proxy for an object in another process, identified by a 32-bit handle.
/// One instance per (device, handle) pair, enforced by the registry.
pub struct RemoteObject {
    ipc: Weak<Ipc>,
    handle: u32,
    dead: AtomicBool,
    acquired: AtomicBool,
    death_requested: AtomicBool,
    next_death_id: AtomicU64,
    death_handlers: Mutex<Vec<(u64, Box<dyn Fn() + Send>)>>,
}

impl RemoteObject {
    pub(crate) fn new(ipc: &Weak<Ipc>, handle: u32, acquire: bool) -> Arc<Self> {
        let obj = Arc::new(RemoteObject {
            ipc: ipc.clone(),
            handle,
            dead: AtomicBool::new(false),
            acquired: AtomicBool::new(acquire),
            death_requested: AtomicBool::new(false),
            next_death_id: AtomicU64::new(1),
            death_handlers: Mutex::new(Vec::new()),
        });
        if acquire {
            if let Some(ipc) = obj.ipc.upgrade() {
                ipc.driver().increfs(handle);
                ipc.driver().acquire(handle);
            }
        }
        obj
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn ipc(&self) -> Option<Arc<Ipc>> {
        self.ipc.upgrade()
    }

    /// Blocking two-way call on the calling thread. Fails fast with
    /// DEAD_OBJECT once the remote has died.
    pub fn transact_sync_reply(&self, code: u32, req: &LocalRequest)
        -> (Option<RemoteReply>, i32) {
        if self.is_dead() {
            return (None, STATUS_DEAD_OBJECT);
        }
        match self.ipc.upgrade() {
            Some(ipc) => ipc.transact_sync_reply(self.handle, code, req),
            None => (None, STATUS_DEAD_OBJECT),
        }
    }

    pub fn transact_sync_oneway(&self, code: u32, req: &LocalRequest) -> i32 {
        if self.is_dead() {
            return STATUS_DEAD_OBJECT;
        }
        match self.ipc.upgrade() {
            Some(ipc) => ipc.transact_sync_oneway(self.handle, code, req),
            None => STATUS_DEAD_OBJECT,
        }
    }

    /// Registers a death handler, asking the kernel for the notification
    /// the first time around. Returns an id for removal.
    pub fn add_death_handler<F: Fn() + Send + 'static>(&self, handler: F) -> u64 {
        let id = self.next_death_id.fetch_add(1, Ordering::SeqCst);
        self.death_handlers.lock().unwrap().push((id, Box::new(handler)));
        if !self.death_requested.swap(true, Ordering::SeqCst) {
            if let Some(ipc) = self.ipc.upgrade() {
                ipc.driver().request_death_notification(self.handle);
            }
        }
        id
    }

    pub fn remove_death_handler(&self, id: u64) -> bool {
        let mut handlers = self.death_handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() && self.death_requested.swap(false, Ordering::SeqCst) {
            if let Some(ipc) = self.ipc.upgrade() {
                ipc.driver().clear_death_notification(self.handle);
            }
        }
        removed
    }

    /// BR_DEAD_BINDER arrived for this handle. Handlers fire exactly once;
    /// BC_DEAD_BINDER_DONE goes out after the fan-out.
    pub(crate) fn handle_death_notification(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            warn!("Duplicate death notification for handle {}", self.handle);
            return;
        }
        debug!("Handle {} is dead", self.handle);
        let handlers = std::mem::take(&mut *self.death_handlers.lock().unwrap());
        for (_, handler) in &handlers {
            handler();
        }
        if let Some(ipc) = self.ipc.upgrade() {
            ipc.driver().dead_binder_done(self.handle);
        }
    }
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        if let Some(ipc) = self.ipc.upgrade() {
            ipc.registry().remote_disposed(self.handle);
            if self.acquired.load(Ordering::SeqCst) && !self.is_dead() {
                ipc.driver().release(self.handle);
                ipc.driver().decrefs(self.handle);
            }
        }
    }
}
