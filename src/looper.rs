//! Looper threads and the looper-to-event-thread transaction handoff.
//!
//! A looper blocks in the kernel's read loop. When it receives a
//! transaction it never runs the application handler itself; it allocates a
//! `LooperTx`, posts it to the event thread and sleeps on the transaction
//! pipe until a completion byte arrives:
//!
//! - the handler returned a reply: the event thread writes TX_DONE;
//! - the handler blocked the request: TX_BLOCKED first, then TX_DONE once
//!   `PendingReply::complete` fires.
//!
//! A blocked looper moves itself out of the primary set (spawning a
//! replacement when it was the last one), and either migrates back or exits
//! when released, depending on how many primaries exist by then.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{close, pipe, read, write};

use crate::driver::{Driver, Handler};
use crate::eventloop;
use crate::ipc::Ipc;
use crate::object::LocalObject;
use crate::reply::LocalReply;
use crate::request::RemoteRequest;
use crate::sys::TxFlags;
use crate::STATUS_OK;

pub(crate) const TX_DONE: u8 = 0x2a;
pub(crate) const TX_BLOCKED: u8 = 0x3b;

pub(crate) const MAX_PRIMARY_LOOPERS: usize = 5;
const LOOPER_START_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-transaction state machine, driven from the event thread:
///
/// ```text
/// SCHEDULED -> PROCESSING -+-> COMPLETE            (handler replied)
///                          +-> PROCESSED -> COMPLETE (completed in handler)
///                          +-> BLOCKING -> BLOCKED -> COMPLETE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Scheduled,
    Processing,
    Processed,
    Blocking,
    Blocked,
    Complete,
}

struct TxShared {
    state: TxState,
    req: Option<RemoteRequest>,
    reply: Option<LocalReply>,
    status: i32,
}

pub(crate) struct LooperTx {
    pipe_rd: RawFd,
    pipe_wr: RawFd,
    code: u32,
    flags: TxFlags,
    obj: Arc<LocalObject>,
    shared: Mutex<TxShared>,
}

impl LooperTx {
    fn new(obj: Arc<LocalObject>, code: u32, flags: TxFlags,
        req: RemoteRequest) -> Option<Arc<LooperTx>> {
        let (pipe_rd, pipe_wr) = match pipe() {
            Ok(fds) => fds,
            Err(err) => {
                error!("Failed to create a tx pipe: {}", err);
                return None;
            }
        };
        Some(Arc::new(LooperTx {
            pipe_rd,
            pipe_wr,
            code,
            flags,
            obj,
            shared: Mutex::new(TxShared {
                state: TxState::Scheduled,
                req: Some(req),
                reply: None,
                status: STATUS_OK,
            }),
        }))
    }

    fn wake(&self, byte: u8) {
        if write(self.pipe_wr, &[byte]).unwrap_or(0) == 0 {
            warn!("Failed to wake up the looper");
        }
    }

    /// Called through RemoteRequest::block from inside the handler.
    pub(crate) fn block(self: &Arc<Self>) -> Option<PendingReply> {
        let mut shared = self.shared.lock().unwrap();
        if shared.state == TxState::Processing {
            shared.state = TxState::Blocking;
            Some(PendingReply { tx: self.clone() })
        } else {
            warn!("Unexpected state {:?} in block", shared.state);
            None
        }
    }

    fn complete(&self, reply: Option<LocalReply>, status: i32) {
        let mut shared = self.shared.lock().unwrap();
        match shared.state {
            TxState::Blocking => {
                // Completed while the handler is still on the stack
                shared.reply = reply;
                shared.status = status;
                shared.state = TxState::Processed;
            }
            TxState::Blocked => {
                // Really asynchronous completion
                shared.reply = reply;
                shared.status = status;
                shared.state = TxState::Complete;
                drop(shared);
                self.wake(TX_DONE);
            }
            state => {
                warn!("Unexpected state {:?} in request completion", state);
            }
        }
    }

    /// Runs the application handler; executes on the event thread.
    fn handle(self: &Arc<Self>) {
        let mut req = {
            let mut shared = self.shared.lock().unwrap();
            assert_eq!(shared.state, TxState::Scheduled);
            shared.state = TxState::Processing;
            match shared.req.take() {
                Some(req) => req,
                None => return,
            }
        };
        req.tx = Some(self.clone());

        let (reply, status) = self.obj.handle_transaction(&mut req, self.code,
            self.flags);
        req.tx = None;

        let byte = {
            let mut shared = self.shared.lock().unwrap();
            match shared.state {
                TxState::Processing => {
                    shared.reply = reply;
                    shared.status = status;
                    shared.state = TxState::Complete;
                    TX_DONE
                }
                TxState::Processed => {
                    // Result already delivered through PendingReply
                    shared.state = TxState::Complete;
                    TX_DONE
                }
                TxState::Blocking => {
                    shared.state = TxState::Blocked;
                    TX_BLOCKED
                }
                state => {
                    warn!("Unexpected state {:?} after handler", state);
                    TX_DONE
                }
            }
        };
        self.wake(byte);
    }

    fn take_result(&self) -> (Option<LocalReply>, i32) {
        let mut shared = self.shared.lock().unwrap();
        (shared.reply.take(), shared.status)
    }
}

impl Drop for LooperTx {
    fn drop(&mut self) {
        let _ = close(self.pipe_rd);
        let _ = close(self.pipe_wr);
    }
}

/// Completion token returned by `RemoteRequest::block`. The transaction
/// stays open until this fires.
pub struct PendingReply {
    tx: Arc<LooperTx>,
}

impl PendingReply {
    pub fn complete(self, reply: Option<LocalReply>, status: i32) {
        self.tx.complete(reply, status);
    }
}

/// Waits for one byte from the transaction pipe, giving up when the wakeup
/// pipe (looper shutdown) fires instead.
fn wait_tx(wakeup: Option<RawFd>, tx_fd: RawFd) -> Option<u8> {
    let events = PollFlags::POLLIN | PollFlags::POLLERR |
        PollFlags::POLLHUP | PollFlags::POLLNVAL;
    let mut fds = Vec::with_capacity(2);
    if let Some(wakeup) = wakeup {
        fds.push(PollFd::new(wakeup, events));
    }
    fds.push(PollFd::new(tx_fd, events));
    if let Err(err) = poll(&mut fds, -1) {
        warn!("Transaction pipe polling error: {}", err);
        return None;
    }
    let tx_revents = fds.last().and_then(|fd| fd.revents())
        .unwrap_or_else(PollFlags::empty);
    if tx_revents.contains(PollFlags::POLLIN) {
        let mut byte = [0u8; 1];
        match read(tx_fd, &mut byte) {
            Ok(1) => Some(byte[0]),
            Ok(_) => {
                warn!("Nothing was read from the transaction pipe");
                None
            }
            Err(err) => {
                warn!("Transaction pipe read error: {}", err);
                None
            }
        }
    } else {
        None
    }
}

static NEXT_LOOPER_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) struct Looper {
    name: String,
    driver: Arc<Driver>,
    /// The Ipc owns the looper, never the other way around.
    ipc: Weak<Ipc>,
    shutdown_rd: RawFd,
    shutdown_wr: RawFd,
    exit: AtomicBool,
    started: Mutex<bool>,
    start_cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Looper {
    pub(crate) fn new(ipc: &Arc<Ipc>) -> Option<Arc<Looper>> {
        let (shutdown_rd, shutdown_wr) = match pipe() {
            Ok(fds) => fds,
            Err(err) => {
                error!("Failed to create looper pipe: {}", err);
                return None;
            }
        };
        let id = NEXT_LOOPER_ID.fetch_add(1, Ordering::SeqCst);
        let looper = Arc::new(Looper {
            name: format!("{}#{}", ipc.dev(), id),
            driver: ipc.driver().clone(),
            ipc: Arc::downgrade(ipc),
            shutdown_rd,
            shutdown_wr,
            exit: AtomicBool::new(false),
            started: Mutex::new(false),
            start_cond: Condvar::new(),
            thread: Mutex::new(None),
        });
        debug!("Starting looper {}", looper.name);
        let thread_looper = looper.clone();
        match thread::Builder::new()
            .name(looper.name.clone())
            .spawn(move || looper_thread(thread_looper)) {
            Ok(handle) => {
                *looper.thread.lock().unwrap() = Some(handle);
                Some(looper)
            }
            Err(err) => {
                error!("Failed to create looper thread: {}", err);
                None
            }
        }
    }

    fn mark_started(&self) {
        let mut started = self.started.lock().unwrap();
        *started = true;
        self.start_cond.notify_all();
    }

    /// Blocks the caller until the looper thread has entered its loop; a
    /// freshly registered object is not reachable before that.
    pub(crate) fn wait_started(&self) {
        let started = self.started.lock().unwrap();
        if !*started {
            let (guard, result) = self.start_cond
                .wait_timeout_while(started, LOOPER_START_TIMEOUT, |s| !*s)
                .unwrap();
            drop(guard);
            if result.timed_out() {
                warn!("Looper {} failed to start in time", self.name);
            }
        }
    }

    /// Requests the looper thread to exit; does not wait.
    pub(crate) fn stop(&self) {
        debug!("Stopping looper {}", self.name);
        self.exit.store(true, Ordering::SeqCst);
        let _ = write(self.shutdown_wr, &[TX_DONE]);
    }

    pub(crate) fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        let _ = close(self.shutdown_rd);
        let _ = close(self.shutdown_wr);
    }
}

impl Handler for Looper {
    fn can_loop(&self) -> bool {
        !self.exit.load(Ordering::SeqCst)
    }

    fn transact(&self, obj: &Arc<LocalObject>, req: RemoteRequest, code: u32,
        flags: TxFlags) -> (Option<LocalReply>, i32) {
        let tx = match LooperTx::new(obj.clone(), code, flags, req) {
            Some(tx) => tx,
            None => return (None, -libc::EFAULT),
        };

        // Let the local object handle the transaction on the event thread
        let scheduled = tx.clone();
        let callback = eventloop::post_cancellable(move || scheduled.handle());

        // Wait for either transaction completion or looper shutdown
        let mut done = wait_tx(Some(self.shutdown_rd), tx.pipe_rd);
        let mut was_blocked = false;
        if done == Some(TX_BLOCKED) {
            /*
             * This looper is now blocked for a potentially significant
             * period of time. Move it out of the primary set; the Ipc
             * spawns a replacement when no primary is left, started
             * synchronously so it is ready for the next incoming
             * transaction.
             */
            if let Some(ipc) = self.ipc.upgrade() {
                let (blocked, replacement) = ipc.looper_blocked(self);
                was_blocked = blocked;
                if blocked {
                    debug!("Primary looper {} is blocked", self.name);
                }
                if let Some(replacement) = replacement {
                    replacement.wait_started();
                }
            }
            // Block until the asynchronous completion arrives
            done = wait_tx(Some(self.shutdown_rd), tx.pipe_rd);
            if done == Some(TX_DONE) {
                debug!("Looper {} is released", self.name);
            }
        }

        let result = if done == Some(TX_DONE) {
            tx.take_result()
        } else {
            (None, -libc::EFAULT)
        };
        // If the wait was abandoned, the handler must not run later
        callback.cancel();

        if was_blocked {
            if let Some(ipc) = self.ipc.upgrade() {
                if ipc.looper_unblocked(self) {
                    // Too many primary loopers by now, exit when idle
                    self.exit.store(true, Ordering::SeqCst);
                }
            }
        }
        result
    }
}

fn looper_thread(looper: Arc<Looper>) {
    let driver = looper.driver.clone();
    if driver.enter_looper() {
        debug!("Looper {} running", looper.name);
        looper.mark_started();
        while !looper.exit.load(Ordering::SeqCst) {
            let (binder, pipe) = match driver.poll(Some(looper.shutdown_rd), -1) {
                Ok(revents) => revents,
                Err(err) => {
                    warn!("Looper {} poll error: {}", looper.name, err);
                    break;
                }
            };
            if binder.contains(PollFlags::POLLIN) {
                let ipc = match looper.ipc.upgrade() {
                    Some(ipc) => ipc,
                    None => break,
                };
                let registry = ipc.registry().clone();
                let ret = driver.read(&registry, Some(&*looper as &dyn Handler));
                drop(ipc);
                if ret < 0 {
                    debug!("Looper {} failed", looper.name);
                    break;
                }
            } else if !binder.is_empty() {
                debug!("Looper {} got revents {:?}", looper.name, binder);
                break;
            }
            // Any event on the shutdown pipe terminates the loop
            if !pipe.is_empty() || looper.exit.load(Ordering::SeqCst) {
                debug!("Looper {} is requested to exit", looper.name);
                break;
            }
        }
        driver.exit_looper();
    } else {
        looper.mark_started();
    }

    if let Some(ipc) = looper.ipc.upgrade() {
        // Spontaneous exit removes the looper from whichever list holds it
        ipc.looper_exited(&looper);
    }
    debug!("Looper {} exits", looper.name);
}

/// Handler used while an async worker waits for its own transaction and a
/// valid incoming transaction arrives in the middle. Rare enough that a
/// fresh transaction pipe per occurrence keeps things simple.
pub(crate) struct TxHandler;

impl Handler for TxHandler {
    fn transact(&self, obj: &Arc<LocalObject>, req: RemoteRequest, code: u32,
        flags: TxFlags) -> (Option<LocalReply>, i32) {
        let tx = match LooperTx::new(obj.clone(), code, flags, req) {
            Some(tx) => tx,
            None => return (None, -libc::EFAULT),
        };
        let scheduled = tx.clone();
        let callback = eventloop::post_cancellable(move || scheduled.handle());

        let mut done = wait_tx(None, tx.pipe_rd);
        if done == Some(TX_BLOCKED) {
            done = wait_tx(None, tx.pipe_rd);
        }
        let result = if done == Some(TX_DONE) {
            tx.take_result()
        } else {
            (None, -libc::EFAULT)
        };
        callback.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IO64;
    use crate::protocol::AIDL;
    use std::time::Duration;

    fn make_req() -> RemoteRequest {
        RemoteRequest::new(&AIDL, 0, 0)
    }

    #[test]
    fn wait_tx_sees_written_byte() {
        let (rd, wr) = pipe().unwrap();
        write(wr, &[TX_DONE]).unwrap();
        assert_eq!(wait_tx(None, rd), Some(TX_DONE));
        let _ = close(rd);
        let _ = close(wr);
    }

    #[test]
    fn wait_tx_prefers_tx_pipe() {
        let (rd, wr) = pipe().unwrap();
        let (shutdown_rd, shutdown_wr) = pipe().unwrap();
        write(wr, &[TX_BLOCKED]).unwrap();
        assert_eq!(wait_tx(Some(shutdown_rd), rd), Some(TX_BLOCKED));
        for fd in [rd, wr, shutdown_rd, shutdown_wr].iter() {
            let _ = close(*fd);
        }
    }

    #[test]
    fn wait_tx_gives_up_on_shutdown() {
        let (rd, wr) = pipe().unwrap();
        let (shutdown_rd, shutdown_wr) = pipe().unwrap();
        write(shutdown_wr, &[TX_DONE]).unwrap();
        assert_eq!(wait_tx(Some(shutdown_rd), rd), None);
        for fd in [rd, wr, shutdown_rd, shutdown_wr].iter() {
            let _ = close(*fd);
        }
    }

    #[test]
    fn tx_synchronous_reply() {
        let obj = LocalObject::for_test(&["test"], |obj, _req, code, _flags| {
            assert_eq!(code, 5);
            let mut reply = LocalReply::new(&IO64);
            reply.writer().append_i32(1234);
            let _ = obj;
            (Some(reply), 42)
        });
        let tx = LooperTx::new(obj, 5, TxFlags::empty(), make_req()).unwrap();
        let scheduled = tx.clone();
        let worker = thread::spawn(move || scheduled.handle());
        assert_eq!(wait_tx(None, tx.pipe_rd), Some(TX_DONE));
        worker.join().unwrap();
        let (reply, status) = tx.take_result();
        assert!(reply.is_some());
        assert_eq!(status, 42);
    }

    #[test]
    fn tx_blocked_then_completed() {
        let pending: Arc<Mutex<Option<PendingReply>>> =
            Arc::new(Mutex::new(None));
        let slot = pending.clone();
        let obj = LocalObject::for_test(&["test"], move |_obj, req, _code, _flags| {
            *slot.lock().unwrap() = req.block();
            (None, STATUS_OK)
        });
        let tx = LooperTx::new(obj, 7, TxFlags::empty(), make_req()).unwrap();
        let scheduled = tx.clone();
        let worker = thread::spawn(move || scheduled.handle());
        assert_eq!(wait_tx(None, tx.pipe_rd), Some(TX_BLOCKED));
        worker.join().unwrap();

        // Complete from "somewhere else" later
        let token = pending.lock().unwrap().take().unwrap();
        let completer = {
            let done = thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                token.complete(None, 7);
            });
            done
        };
        assert_eq!(wait_tx(None, tx.pipe_rd), Some(TX_DONE));
        completer.join().unwrap();
        assert_eq!(tx.take_result().1, 7);
    }

    #[test]
    fn tx_completed_inside_handler() {
        let obj = LocalObject::for_test(&["test"], |_obj, req, _code, _flags| {
            let token = req.block().unwrap();
            token.complete(None, 9);
            (None, STATUS_OK)
        });
        let tx = LooperTx::new(obj, 1, TxFlags::empty(), make_req()).unwrap();
        let scheduled = tx.clone();
        let worker = thread::spawn(move || scheduled.handle());
        // Immediate async completion still looks synchronous to the looper
        assert_eq!(wait_tx(None, tx.pipe_rd), Some(TX_DONE));
        worker.join().unwrap();
        assert_eq!(tx.take_result().1, 9);
    }

    #[test]
    fn block_outside_transaction_fails() {
        let mut req = make_req();
        assert!(req.block().is_none());
    }
}
