//! Per-device IPC coordinator.
//!
//! One `Ipc` per binder device path, process-wide. It owns the driver, the
//! object registry, a bounded worker pool for asynchronous outbound
//! transactions and the looper threads that service incoming ones.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::driver::Driver;
use crate::eventloop;
use crate::io::Io;
use crate::looper::{Looper, TxHandler, MAX_PRIMARY_LOOPERS};
use crate::object::LocalObject;
use crate::registry::ObjectRegistry;
use crate::reply::RemoteReply;
use crate::request::LocalRequest;
use crate::sys::{self, TxFlags};
use crate::{Error, STATUS_OK};

/// Binder requests block their thread; this many workers bound the number
/// of asynchronous requests in flight.
pub(crate) const MAX_TX_THREADS: usize = 15;

static IPC_TABLE: Mutex<Option<HashMap<String, Weak<Ipc>>>> = Mutex::new(None);
static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

type Job = Box<dyn FnOnce() + Send>;

struct PoolQueue {
    jobs: VecDeque<Job>,
    idle: usize,
    spawned: usize,
    max: usize,
    shutdown: bool,
}

/// Lazily grown worker pool over one shared queue.
struct TxPool {
    queue: Mutex<PoolQueue>,
    cond: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TxPool {
    fn new(max: usize) -> Arc<TxPool> {
        Arc::new(TxPool {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                idle: 0,
                spawned: 0,
                max,
                shutdown: false,
            }),
            cond: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    fn push(self: &Arc<Self>, job: Job) {
        let spawn_worker = {
            let mut queue = self.queue.lock().unwrap();
            if queue.shutdown {
                return;
            }
            queue.jobs.push_back(job);
            if queue.idle == 0 && queue.spawned < queue.max {
                queue.spawned += 1;
                true
            } else {
                false
            }
        };
        if spawn_worker {
            let pool = self.clone();
            let handle = thread::Builder::new()
                .name("binder-tx".to_string())
                .spawn(move || pool.worker())
                .expect("failed to spawn a tx worker");
            self.threads.lock().unwrap().push(handle);
        }
        self.cond.notify_one();
    }

    fn worker(&self) {
        loop {
            let job = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break job;
                    }
                    if queue.shutdown {
                        return;
                    }
                    queue.idle += 1;
                    queue = self.cond.wait(queue).unwrap();
                    queue.idle -= 1;
                }
            };
            job();
        }
    }

    fn set_max(&self, max: usize) {
        self.queue.lock().unwrap().max = max;
    }

    /// Runs the queue dry and joins the workers.
    fn shutdown(&self) {
        self.queue.lock().unwrap().shutdown = true;
        self.cond.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

struct LooperLists {
    primary: Vec<Arc<Looper>>,
    blocked: Vec<Arc<Looper>>,
}

/// An asynchronous transaction as seen from the table: its id and whether
/// it was cancelled.
struct IpcTx {
    id: u64,
    cancelled: AtomicBool,
}

pub struct Ipc {
    dev: String,
    driver: Arc<Driver>,
    registry: Arc<ObjectRegistry>,
    pool: Arc<TxPool>,
    tx_table: Mutex<HashMap<u64, Arc<IpcTx>>>,
    loopers: Mutex<LooperLists>,
}

impl Ipc {
    /// The Ipc for a device path, opening the device on first use. Repeated
    /// calls with the same path return the same instance.
    pub fn new(dev: Option<&str>) -> Result<Arc<Ipc>, Error> {
        let dev = match dev {
            Some(dev) if !dev.is_empty() => dev,
            _ => sys::DEFAULT_BINDER_DEVICE,
        };
        let mut table = IPC_TABLE.lock().unwrap();
        let table = table.get_or_insert_with(HashMap::new);
        if let Some(existing) = table.get(dev).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let driver = Arc::new(Driver::new(dev, None)?);
        let registry = ObjectRegistry::new();
        let ipc = Arc::new(Ipc {
            dev: dev.to_string(),
            driver,
            registry: registry.clone(),
            pool: TxPool::new(MAX_TX_THREADS),
            tx_table: Mutex::new(HashMap::new()),
            loopers: Mutex::new(LooperLists {
                primary: Vec::new(),
                blocked: Vec::new(),
            }),
        });
        registry.set_ipc(&ipc);
        table.insert(dev.to_string(), Arc::downgrade(&ipc));
        Ok(ipc)
    }

    pub fn dev(&self) -> &str {
        &self.dev
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn io(&self) -> &'static dyn Io {
        self.driver.io()
    }

    /// A request pre-loaded with this device's RPC header for `iface`.
    pub fn local_request(&self, iface: Option<&str>) -> LocalRequest {
        self.driver.local_request(iface)
    }

    /// Blocking two-way transaction on the calling thread.
    pub fn transact_sync_reply(&self, handle: u32, code: u32,
        req: &LocalRequest) -> (Option<RemoteReply>, i32) {
        let mut reply = RemoteReply::new();
        let status = self.driver.transact(&self.registry, None, handle, code,
            req, Some(&mut reply));
        if status == STATUS_OK || !reply.is_empty() {
            (Some(reply), status)
        } else {
            (None, status)
        }
    }

    /// Blocking one-way transaction on the calling thread.
    pub fn transact_sync_oneway(&self, handle: u32, code: u32,
        req: &LocalRequest) -> i32 {
        self.driver.transact(&self.registry, None, handle, code, req, None)
    }

    fn new_tx_id(&self) -> u64 {
        let table = self.tx_table.lock().unwrap();
        loop {
            let id = NEXT_TX_ID.fetch_add(1, Ordering::SeqCst);
            if id != 0 && !table.contains_key(&id) {
                return id;
            }
        }
    }

    fn submit_tx<E>(self: &Arc<Self>, exec: E) -> u64
    where
        E: FnOnce(&Arc<Ipc>, &Arc<IpcTx>) + Send + 'static,
    {
        let tx = Arc::new(IpcTx {
            id: self.new_tx_id(),
            cancelled: AtomicBool::new(false),
        });
        let id = tx.id;
        self.tx_table.lock().unwrap().insert(id, tx.clone());
        let ipc = self.clone();
        self.pool.push(Box::new(move || exec(&ipc, &tx)));
        id
    }

    /// Posts a transaction to the worker pool. The completion callback runs
    /// on the event thread unless the transaction is cancelled first.
    /// Returns an id usable with `cancel`.
    pub fn transact<F>(self: &Arc<Self>, handle: u32, code: u32,
        flags: TxFlags, req: LocalRequest, on_reply: F) -> u64
    where
        F: FnOnce(Option<RemoteReply>, i32) + Send + 'static,
    {
        self.submit_tx(move |ipc, tx| {
            let mut reply_out = None;
            let mut status = -libc::ECANCELED;
            if !tx.cancelled.load(Ordering::SeqCst) {
                let handler: &dyn crate::driver::Handler = &TxHandler;
                if flags.contains(TxFlags::ONEWAY) {
                    status = ipc.driver.transact(&ipc.registry, Some(handler),
                        handle, code, &req, None);
                } else {
                    let mut reply = RemoteReply::new();
                    status = ipc.driver.transact(&ipc.registry, Some(handler),
                        handle, code, &req, Some(&mut reply));
                    if status == STATUS_OK || !reply.is_empty() {
                        reply_out = Some(reply);
                    }
                }
            } else {
                trace!("not executing transaction {} (cancelled)", tx.id);
            }
            let ipc = ipc.clone();
            let tx = tx.clone();
            eventloop::post(move || {
                ipc.tx_table.lock().unwrap().remove(&tx.id);
                if !tx.cancelled.load(Ordering::SeqCst) {
                    on_reply(reply_out, status);
                }
            });
        })
    }

    /// Runs an arbitrary job on the worker pool with the same id/cancel
    /// lifecycle as a transaction; `done` runs on the event thread.
    pub fn transact_custom<E, D>(self: &Arc<Self>, exec: E, done: D) -> u64
    where
        E: FnOnce() + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        self.submit_tx(move |ipc, tx| {
            if !tx.cancelled.load(Ordering::SeqCst) {
                exec();
            }
            let ipc = ipc.clone();
            let tx = tx.clone();
            eventloop::post(move || {
                ipc.tx_table.lock().unwrap().remove(&tx.id);
                if !tx.cancelled.load(Ordering::SeqCst) {
                    done();
                }
            });
        })
    }

    /// Marks a pending transaction cancelled. A queued transaction won't
    /// run; a running one completes but its callback is suppressed.
    pub fn cancel(&self, id: u64) {
        match self.tx_table.lock().unwrap().get(&id) {
            Some(tx) => {
                trace!("cancelling transaction {}", id);
                tx.cancelled.store(true, Ordering::SeqCst);
            }
            None => warn!("Invalid transaction id {}", id),
        }
    }

    pub fn set_max_threads(&self, max: usize) {
        self.pool.set_max(max);
    }

    pub(crate) fn register_local_object(self: &Arc<Self>, obj: &Arc<LocalObject>) {
        self.registry.register_local(obj);
        self.ensure_primary_looper();
    }

    /// At least one primary looper must exist whenever a local object is
    /// registered; otherwise nobody would ever read the transaction.
    pub(crate) fn ensure_primary_looper(self: &Arc<Self>) {
        let looper = {
            let mut lists = self.loopers.lock().unwrap();
            if lists.primary.is_empty() {
                match Looper::new(self) {
                    Some(looper) => {
                        lists.primary.push(looper.clone());
                        Some(looper)
                    }
                    None => None,
                }
            } else {
                None
            }
        };
        // Not ready to accept transactions until the looper has started
        if let Some(looper) = looper {
            looper.wait_started();
        }
    }

    pub(crate) fn primary_looper_count(&self) -> usize {
        self.loopers.lock().unwrap().primary.len()
    }

    /// Moves a looper from the primary to the blocked set; spawns a
    /// replacement when it was the last primary. Returns whether the move
    /// happened and the replacement (not yet started).
    pub(crate) fn looper_blocked(self: &Arc<Self>, looper: &Looper)
        -> (bool, Option<Arc<Looper>>) {
        let mut lists = self.loopers.lock().unwrap();
        let index = lists.primary.iter()
            .position(|l| std::ptr::eq(&**l, looper));
        match index {
            Some(index) => {
                let blocked = lists.primary.remove(index);
                lists.blocked.push(blocked);
                let replacement = if lists.primary.is_empty() {
                    match Looper::new(self) {
                        Some(new_looper) => {
                            lists.primary.push(new_looper.clone());
                            Some(new_looper)
                        }
                        None => None,
                    }
                } else {
                    None
                };
                (true, replacement)
            }
            None => (false, None),
        }
    }

    /// Reinstates (or retires) a previously blocked looper. Returns true
    /// when the looper should exit because the primary set is full again.
    pub(crate) fn looper_unblocked(&self, looper: &Looper) -> bool {
        let mut lists = self.loopers.lock().unwrap();
        let index = lists.blocked.iter()
            .position(|l| std::ptr::eq(&**l, looper));
        let n = lists.primary.len();
        if n >= MAX_PRIMARY_LOOPERS {
            debug!("Too many primary loopers ({})", n);
            if let Some(index) = index {
                lists.blocked.remove(index);
            }
            true
        } else {
            if let Some(index) = index {
                let looper = lists.blocked.remove(index);
                lists.primary.push(looper);
            }
            false
        }
    }

    /// Spontaneous looper exit; forget it wherever it is.
    pub(crate) fn looper_exited(&self, looper: &Arc<Looper>) {
        let mut lists = self.loopers.lock().unwrap();
        lists.primary.retain(|l| !Arc::ptr_eq(l, looper));
        lists.blocked.retain(|l| !Arc::ptr_eq(l, looper));
    }

    fn stop_loopers(&self) {
        let stopped = {
            let mut lists = self.loopers.lock().unwrap();
            let mut stopped = std::mem::take(&mut lists.primary);
            stopped.append(&mut lists.blocked);
            stopped
        };
        for looper in &stopped {
            looper.stop();
        }
        for looper in &stopped {
            looper.join();
        }
    }

    /// Stops the loopers, drains the worker pool and releases the kernel
    /// references held by local objects. The device closes when the last
    /// reference to the Ipc goes away.
    pub fn shutdown(&self) {
        debug!("Shutting down {}", self.dev);
        self.stop_loopers();
        self.pool.shutdown();
        for obj in self.registry.live_locals() {
            obj.drop_kernel_refs();
        }
    }
}

impl Drop for Ipc {
    fn drop(&mut self) {
        let mut table = IPC_TABLE.lock().unwrap();
        if let Some(map) = table.as_mut() {
            if let Some(entry) = map.get(&self.dev) {
                if entry.upgrade().is_none() {
                    map.remove(&self.dev);
                }
            }
            if map.is_empty() {
                *table = None;
            }
        }
        drop(table);
        self.stop_loopers();
        self.pool.shutdown();
    }
}

/// Process-wide teardown: shuts down every live Ipc. Mirrors the library
/// exit path of the C world, where this runs from a destructor.
pub fn ipc_exit() {
    let ipcs: Vec<Arc<Ipc>> = {
        let table = IPC_TABLE.lock().unwrap();
        match table.as_ref() {
            Some(map) => map.values().filter_map(Weak::upgrade).collect(),
            None => Vec::new(),
        }
    };
    for ipc in ipcs {
        ipc.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn pool_runs_jobs() {
        let pool = TxPool::new(3);
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let count = count.clone();
            let tx = tx.clone();
            pool.push(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
        }
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(pool.queue.lock().unwrap().spawned <= 3);
        pool.shutdown();
    }

    #[test]
    fn pool_bounds_workers() {
        let pool = TxPool::new(2);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let gate = gate.clone();
            let tx = tx.clone();
            pool.push(Box::new(move || {
                let (lock, cond) = &*gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cond.wait(open).unwrap();
                }
                let _ = tx.send(());
            }));
        }
        // Give the pool a moment; it must not exceed its bound
        thread::sleep(Duration::from_millis(50));
        assert!(pool.queue.lock().unwrap().spawned <= 2);
        *gate.0.lock().unwrap() = true;
        gate.1.notify_all();
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        pool.shutdown();
    }

    #[test]
    fn pool_shutdown_is_idempotent() {
        let pool = TxPool::new(1);
        pool.push(Box::new(|| {}));
        pool.shutdown();
        pool.shutdown();
        // Jobs after shutdown are dropped
        pool.push(Box::new(|| panic!("must not run")));
    }

    #[test]
    fn tx_ids_are_unique_and_nonzero() {
        let mut last = 0;
        for _ in 0..100 {
            let id = NEXT_TX_ID.fetch_add(1, Ordering::SeqCst);
            assert_ne!(id, 0);
            assert!(id > last);
            last = id;
        }
    }
}
