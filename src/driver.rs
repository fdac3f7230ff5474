//! The driver adapter: owns the device fd and the receive mapping, frames
//! outbound commands and inbound returns, and drives transactions.

use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian as LE};
use log::{debug, error, trace, warn};
use nix::fcntl::{open, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;

use crate::buffer::{Buffer, BufferContents};
use crate::io::{self, Io, IoBuf, READ_BUFFER_SIZE,
    MAX_BC_TRANSACTION_SG_SIZE, MAX_COOKIE_SIZE, MAX_HANDLE_COOKIE_SIZE,
    MAX_POINTER_SIZE, MAX_PTR_COOKIE_SIZE};
use crate::object::{LocalObject, TransactionSupport};
use crate::protocol::{self, RpcProtocol};
use crate::registry::{ObjectRegistry, RemoteLookup};
use crate::reply::{LocalReply, RemoteReply};
use crate::request::{LocalRequest, RemoteRequest};
use crate::sys::{self, TxFlags};
use crate::writer::OutputData;
use crate::{Error, STATUS_DEAD_OBJECT, STATUS_FAILED, STATUS_OK};

/// Something that takes over incoming transactions from the read loop.
/// Loopers post them to the event thread; a missing handler means the
/// caller runs them inline.
pub(crate) trait Handler: Sync {
    fn can_loop(&self) -> bool {
        false
    }
    fn transact(&self, obj: &Arc<LocalObject>, req: RemoteRequest, code: u32,
        flags: TxFlags) -> (Option<LocalReply>, i32);
}

/// Accumulates the kernel's return stream. The size of each packet is
/// encoded in its command code; a packet that didn't fit completely stays
/// in the buffer until the next BINDER_WRITE_READ appends the rest.
pub(crate) struct ReadBuf {
    data: [u8; READ_BUFFER_SIZE],
    /// Bytes the kernel has filled in.
    consumed: usize,
    /// Bytes already dispatched.
    offset: usize,
}

impl ReadBuf {
    pub(crate) fn new() -> Self {
        ReadBuf { data: [0; READ_BUFFER_SIZE], consumed: 0, offset: 0 }
    }

    fn next_command(&self) -> Option<u32> {
        let remaining = self.consumed.checked_sub(self.offset)?;
        if remaining >= 4 {
            let cmd = LE::read_u32(&self.data[self.offset..]);
            if remaining >= 4 + sys::ioc_size(cmd) {
                return Some(cmd);
            }
        }
        None
    }

    /// Pops the next complete packet as (code, payload).
    pub(crate) fn take_command(&mut self) -> Option<(u32, Vec<u8>)> {
        let cmd = self.next_command()?;
        let datalen = sys::ioc_size(cmd);
        let start = self.offset + 4;
        let data = self.data[start..start + datalen].to_vec();
        self.offset = start + datalen;
        Some((cmd, data))
    }

    /// Moves the unprocessed tail to the front, making room for the next
    /// portion of data.
    pub(crate) fn compact(&mut self) {
        if self.consumed > self.offset {
            let unprocessed = self.consumed - self.offset;
            self.data.copy_within(self.offset..self.consumed, 0);
            self.consumed = unprocessed;
        } else {
            self.consumed = 0;
        }
        self.offset = 0;
    }

    /// True when a partial packet is waiting for the rest of its bytes.
    pub(crate) fn has_pending(&self) -> bool {
        self.consumed > 0
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.data[self.consumed..self.consumed + bytes.len()]
            .copy_from_slice(bytes);
        self.consumed += bytes.len();
    }
}

/// Refcount drops queued during a read batch. Processing them inline would
/// allow reentrant destruction while the driver is mid-parse.
enum DeferredRef {
    Decrefs(Arc<LocalObject>),
    Release(Arc<LocalObject>),
}

struct Context {
    unrefs: Vec<DeferredRef>,
}

impl Context {
    fn new() -> Self {
        Context { unrefs: Vec::new() }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for deferred in self.unrefs.drain(..) {
            match deferred {
                DeferredRef::Decrefs(obj) => obj.handle_decrefs(),
                DeferredRef::Release(obj) => obj.handle_release(),
            }
        }
    }
}

pub struct Driver {
    fd: RawFd,
    vm: u64,
    vmsize: usize,
    dev: String,
    io: &'static dyn Io,
    protocol: &'static dyn RpcProtocol,
}

impl Driver {
    pub fn new(dev: &str, protocol: Option<&'static dyn RpcProtocol>)
        -> Result<Driver, Error> {
        let fd = open(dev, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())?;
        let result = Self::setup(fd, dev, protocol);
        if result.is_err() {
            let _ = close(fd);
        }
        result
    }

    fn setup(fd: RawFd, dev: &str, protocol: Option<&'static dyn RpcProtocol>)
        -> Result<Driver, Error> {
        let mut version = sys::BinderVersion { protocol_version: 0 };
        unsafe { sys::binder_read_version(fd, &mut version) }?;
        debug!("Opened {} version {}", dev, version.protocol_version);
        let io = io::for_version(version.protocol_version)
            .ok_or(Error::UnsupportedVersion(version.protocol_version))?;

        // A chunk of virtual address space for receiving transactions
        let vmsize = sys::binder_vm_size();
        let vm = unsafe {
            mmap(ptr::null_mut(), vmsize, ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE, fd, 0)
        }?;

        let max_threads = sys::DEFAULT_MAX_BINDER_THREADS;
        if let Err(err) = unsafe { sys::binder_set_max_threads(fd, &max_threads) } {
            error!("{} failed to set max threads ({}): {}", dev, max_threads, err);
        }

        Ok(Driver {
            fd,
            vm: vm as u64,
            vmsize,
            dev: dev.to_string(),
            io,
            protocol: protocol.unwrap_or_else(|| protocol::for_device(dev)),
        })
    }

    pub fn dev(&self) -> &str {
        &self.dev
    }

    pub fn io(&self) -> &'static dyn Io {
        self.io
    }

    pub fn protocol(&self) -> &'static dyn RpcProtocol {
        self.protocol
    }

    /// Writes until the whole buffer is consumed or a fatal error shows up.
    fn write(&self, buf: &mut IoBuf) -> i32 {
        let mut err = -libc::EAGAIN;
        while err == -libc::EAGAIN {
            trace!("write({}) {}/{}", self.fd, buf.consumed, buf.size);
            err = self.io.write_read(self.fd, Some(buf), None);
        }
        err
    }

    fn write_read_buf(&self, mut write: Option<&mut IoBuf>, rbuf: &mut ReadBuf)
        -> i32 {
        let mut rio = IoBuf {
            ptr: rbuf.data.as_ptr() as u64 + rbuf.offset as u64,
            size: READ_BUFFER_SIZE - rbuf.offset,
            consumed: rbuf.consumed - rbuf.offset,
        };
        let mut err = -libc::EAGAIN;
        while err == -libc::EAGAIN {
            err = self.io.write_read(self.fd, write.as_deref_mut(), Some(&mut rio));
        }
        rbuf.consumed = rio.consumed + rbuf.offset;
        if err < 0 {
            warn!("binder_write_read: {}", nix::errno::Errno::from_i32(-err));
        }
        err
    }

    fn cmd(&self, code: u32) -> bool {
        let mut bytes = [0u8; 4];
        LE::write_u32(&mut bytes, code);
        let mut buf = IoBuf::new(bytes.as_ptr(), bytes.len());
        self.write(&mut buf) >= 0
    }

    fn cmd_u32(&self, code: u32, param: u32) -> bool {
        let mut bytes = [0u8; 8];
        LE::write_u32(&mut bytes[0..], code);
        LE::write_u32(&mut bytes[4..], param);
        let mut buf = IoBuf::new(bytes.as_ptr(), bytes.len());
        self.write(&mut buf) >= 0
    }

    /// Echoes a command whose payload we already have in wire form.
    fn cmd_data(&self, code: u32, payload: &[u8]) -> bool {
        let mut bytes = Vec::with_capacity(4 + payload.len());
        bytes.extend_from_slice(&code.to_le_bytes());
        bytes.extend_from_slice(payload);
        let mut buf = IoBuf::new(bytes.as_ptr(), bytes.len());
        self.write(&mut buf) >= 0
    }

    pub(crate) fn enter_looper(&self) -> bool {
        trace!("< BC_ENTER_LOOPER");
        self.cmd(self.io.bc().enter_looper)
    }

    pub(crate) fn exit_looper(&self) -> bool {
        trace!("< BC_EXIT_LOOPER");
        self.cmd(self.io.bc().exit_looper)
    }

    pub(crate) fn increfs(&self, handle: u32) -> bool {
        trace!("< BC_INCREFS 0x{:08x}", handle);
        self.cmd_u32(self.io.bc().increfs, handle)
    }

    pub(crate) fn decrefs(&self, handle: u32) -> bool {
        trace!("< BC_DECREFS 0x{:08x}", handle);
        self.cmd_u32(self.io.bc().decrefs, handle)
    }

    pub(crate) fn acquire(&self, handle: u32) -> bool {
        trace!("< BC_ACQUIRE 0x{:08x}", handle);
        self.cmd_u32(self.io.bc().acquire, handle)
    }

    pub(crate) fn release(&self, handle: u32) -> bool {
        trace!("< BC_RELEASE 0x{:08x}", handle);
        self.cmd_u32(self.io.bc().release, handle)
    }

    pub(crate) fn acquire_done(&self, ptr: u64) -> bool {
        trace!("< BC_ACQUIRE_DONE 0x{:x}", ptr);
        let mut bytes = [0u8; 4 + MAX_PTR_COOKIE_SIZE];
        LE::write_u32(&mut bytes, self.io.bc().acquire_done);
        let n = self.io.encode_ptr_cookie(&mut bytes[4..], ptr);
        let mut buf = IoBuf::new(bytes.as_ptr(), 4 + n);
        self.write(&mut buf) >= 0
    }

    pub(crate) fn dead_binder_done(&self, handle: u32) -> bool {
        trace!("< BC_DEAD_BINDER_DONE 0x{:08x}", handle);
        let mut bytes = [0u8; 4 + MAX_COOKIE_SIZE];
        LE::write_u32(&mut bytes, self.io.bc().dead_binder_done);
        let n = self.io.encode_cookie(&mut bytes[4..], handle as u64);
        let mut buf = IoBuf::new(bytes.as_ptr(), 4 + n);
        self.write(&mut buf) >= 0
    }

    fn handle_cookie_cmd(&self, code: u32, handle: u32) -> bool {
        let mut bytes = [0u8; 4 + MAX_HANDLE_COOKIE_SIZE];
        LE::write_u32(&mut bytes, code);
        let n = self.io.encode_handle_cookie(&mut bytes[4..], handle);
        let mut buf = IoBuf::new(bytes.as_ptr(), 4 + n);
        self.write(&mut buf) >= 0
    }

    pub(crate) fn request_death_notification(&self, handle: u32) -> bool {
        trace!("< BC_REQUEST_DEATH_NOTIFICATION 0x{:08x}", handle);
        self.handle_cookie_cmd(self.io.bc().request_death_notification, handle)
    }

    pub(crate) fn clear_death_notification(&self, handle: u32) -> bool {
        trace!("< BC_CLEAR_DEATH_NOTIFICATION 0x{:08x}", handle);
        self.handle_cookie_cmd(self.io.bc().clear_death_notification, handle)
    }

    /// Returns a received region to the kernel. Exactly one of these per
    /// received buffer, issued from BufferContents::drop.
    pub(crate) fn free_buffer(&self, buffer: u64) {
        if buffer != 0 {
            trace!("< BC_FREE_BUFFER 0x{:x}", buffer);
            let mut bytes = [0u8; 4 + MAX_POINTER_SIZE];
            LE::write_u32(&mut bytes, self.io.bc().free_buffer);
            let n = self.io.encode_pointer(&mut bytes[4..], buffer);
            let mut buf = IoBuf::new(bytes.as_ptr(), 4 + n);
            self.write(&mut buf);
        }
    }

    fn reply_status(&self, status: i32) -> bool {
        trace!("< BC_REPLY ({})", status);
        let mut bytes = [0u8; 4 + MAX_BC_TRANSACTION_SG_SIZE];
        LE::write_u32(&mut bytes, self.io.bc().reply);
        let n = self.io.encode_status_reply(&mut bytes[4..], &status);
        let mut buf = IoBuf::new(bytes.as_ptr(), 4 + n);
        self.write(&mut buf) >= 0
    }

    fn reply_data(&self, data: OutputData) -> bool {
        let mut bytes = [0u8; 4 + MAX_BC_TRANSACTION_SG_SIZE];
        let mut offsets_buf = Vec::new();
        let n = if data.buffers_size > 0 {
            trace!("< BC_REPLY_SG {} bytes", data.buffers_size);
            LE::write_u32(&mut bytes, self.io.bc().reply_sg);
            self.io.encode_reply_sg(&mut bytes[4..], data.bytes, data.offsets,
                &mut offsets_buf, data.buffers_size)
        } else {
            trace!("< BC_REPLY");
            LE::write_u32(&mut bytes, self.io.bc().reply);
            self.io.encode_reply(&mut bytes[4..], data.bytes, data.offsets,
                &mut offsets_buf)
        };
        let mut buf = IoBuf::new(bytes.as_ptr(), 4 + n);
        self.write(&mut buf) >= 0
    }

    /// Polls the binder fd (and optionally a wakeup pipe). Returns the
    /// revents of both.
    pub(crate) fn poll(&self, pipe: Option<RawFd>, timeout: i32)
        -> nix::Result<(PollFlags, PollFlags)> {
        let events = PollFlags::POLLIN | PollFlags::POLLERR |
            PollFlags::POLLHUP | PollFlags::POLLNVAL;
        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(self.fd, events));
        if let Some(pipe) = pipe {
            fds.push(PollFd::new(pipe, events));
        }
        poll(&mut fds, timeout)?;
        let binder = fds[0].revents().unwrap_or_else(PollFlags::empty);
        let pipe = fds.get(1)
            .and_then(|fd| fd.revents())
            .unwrap_or_else(PollFlags::empty);
        Ok((binder, pipe))
    }

    fn take_buffer(self: &Arc<Self>, tx: &crate::io::TxData) -> Option<Buffer> {
        if tx.data != 0 && tx.size > 0 {
            let objects = tx.objects.as_ref()
                .map(|offsets| offsets.iter().map(|off| tx.data + *off as u64)
                    .collect())
                .unwrap_or_default();
            Some(Buffer::from_contents(BufferContents::new_kernel(
                self.clone(), tx.data, tx.size, objects)))
        } else {
            self.free_buffer(tx.data);
            None
        }
    }

    fn handle_transaction(self: &Arc<Self>, rbuf: &mut ReadBuf,
        reg: &Arc<ObjectRegistry>, handler: Option<&dyn Handler>,
        ctx: &mut Context, data: &[u8]) {
        let tx = self.io.decode_transaction_data(data);
        trace!("> BR_TRANSACTION 0x{:x} 0x{:08x} ({} bytes)",
            tx.target, tx.code, tx.size);
        let flags = TxFlags::from_bits_truncate(tx.flags);
        let mut req = RemoteRequest::new(self.protocol, tx.pid, tx.euid);
        let obj = reg.get_local(tx.target);
        if let Some(buffer) = self.take_buffer(&tx) {
            req.set_data(tx.code, buffer, Some(reg.clone()));
        }

        let mut reply = None;
        let mut status = -libc::EBADMSG;
        match obj {
            Some(obj) => {
                let iface = req.interface().map(str::to_string);
                match obj.classify(iface.as_deref(), tx.code, self.protocol) {
                    TransactionSupport::Looper => {
                        let (r, s) = obj.handle_looper_transaction(&mut req,
                            tx.code, self.protocol);
                        reply = r;
                        status = s;
                    }
                    TransactionSupport::Supported => match handler {
                        Some(handler) => {
                            // The handler owns the request from here on
                            let (r, s) = handler.transact(&obj, req, tx.code,
                                flags);
                            reply = r;
                            status = s;
                        }
                        None => {
                            // Synchronous in-thread case: call the object
                            // directly
                            let (r, s) = obj.handle_transaction(&mut req,
                                tx.code, flags);
                            reply = r;
                            status = s;
                        }
                    },
                    TransactionSupport::NotSupported => {
                        warn!("Unhandled transaction {:?} 0x{:08x}",
                            iface, tx.code);
                    }
                }
            }
            None => {
                warn!("Transaction for unknown object 0x{:x}", tx.target);
            }
        }

        // No reply for one-way transactions
        if !flags.contains(TxFlags::ONEWAY) {
            match &reply {
                Some(reply) => {
                    self.reply_data(reply.data());
                }
                None => {
                    self.reply_status(status);
                }
            }
            // Wait until our own reply is acknowledged
            loop {
                let err = self.write_read_buf(None, rbuf);
                let txstatus = if err >= 0 {
                    self.txstatus(rbuf, reg, handler, ctx, None)
                } else {
                    err
                };
                if txstatus != -libc::EAGAIN {
                    break;
                }
            }
        }
    }

    fn handle_command(self: &Arc<Self>, rbuf: &mut ReadBuf,
        reg: &Arc<ObjectRegistry>, handler: Option<&dyn Handler>,
        ctx: &mut Context, cmd: u32, data: &[u8]) {
        let io = self.io;
        let br = io.br();
        if cmd == br.noop {
            trace!("> BR_NOOP");
        } else if cmd == br.ok {
            trace!("> BR_OK");
        } else if cmd == br.transaction_complete {
            trace!("> BR_TRANSACTION_COMPLETE (?)");
        } else if cmd == br.spawn_looper {
            trace!("> BR_SPAWN_LOOPER");
        } else if cmd == br.finished {
            trace!("> BR_FINISHED");
        } else if cmd == br.increfs {
            let ptr = io.decode_ptr_cookie(data);
            let obj = reg.get_local(ptr);
            trace!("> BR_INCREFS 0x{:x}", ptr);
            if let Some(obj) = obj {
                obj.handle_increfs();
            }
            trace!("< BC_INCREFS_DONE 0x{:x}", ptr);
            self.cmd_data(io.bc().increfs_done, data);
        } else if cmd == br.decrefs {
            let ptr = io.decode_ptr_cookie(data);
            trace!("> BR_DECREFS 0x{:x}", ptr);
            if let Some(obj) = reg.get_local(ptr) {
                // Unrefs run only after the incoming queue is drained
                ctx.unrefs.push(DeferredRef::Decrefs(obj));
            }
        } else if cmd == br.acquire {
            let ptr = io.decode_ptr_cookie(data);
            trace!("> BR_ACQUIRE 0x{:x}", ptr);
            match reg.get_local(ptr) {
                Some(obj) => {
                    obj.handle_acquire();
                    self.acquire_done(ptr);
                }
                None => {
                    // Shouldn't normally happen; send the same data back
                    trace!("< BC_ACQUIRE_DONE");
                    self.cmd_data(io.bc().acquire_done, data);
                }
            }
        } else if cmd == br.release {
            let ptr = io.decode_ptr_cookie(data);
            trace!("> BR_RELEASE 0x{:x}", ptr);
            if let Some(obj) = reg.get_local(ptr) {
                ctx.unrefs.push(DeferredRef::Release(obj));
            }
        } else if cmd == br.transaction {
            self.handle_transaction(rbuf, reg, handler, ctx, data);
        } else if cmd == br.dead_binder {
            let handle = io.decode_cookie(data) as u32;
            trace!("> BR_DEAD_BINDER 0x{:08x}", handle);
            match reg.get_remote(handle, RemoteLookup::DontCreate) {
                Some(obj) => obj.handle_death_notification(),
                None => {
                    // Shouldn't normally happen; acknowledge anyway
                    trace!("< BC_DEAD_BINDER_DONE 0x{:08x}", handle);
                    self.cmd_data(io.bc().dead_binder_done, data);
                }
            }
        } else if cmd == br.clear_death_notification_done {
            trace!("> BR_CLEAR_DEATH_NOTIFICATION_DONE");
        } else if cmd == br.error {
            error!("> BR_ERROR {}", LE::read_i32(data));
        } else {
            warn!("Unexpected command 0x{:08x}", cmd);
        }
    }

    fn handle_commands(self: &Arc<Self>, rbuf: &mut ReadBuf,
        reg: &Arc<ObjectRegistry>, handler: Option<&dyn Handler>,
        ctx: &mut Context) {
        while let Some((cmd, data)) = rbuf.take_command() {
            self.handle_command(rbuf, reg, handler, ctx, cmd, &data);
        }
        rbuf.compact();
    }

    /// Swallows packets until a terminal transaction status shows up, or
    /// the buffer runs dry (-EAGAIN). Unrelated packets are handled in
    /// place.
    fn txstatus(self: &Arc<Self>, rbuf: &mut ReadBuf,
        reg: &Arc<ObjectRegistry>, handler: Option<&dyn Handler>,
        ctx: &mut Context, mut reply: Option<&mut RemoteReply>) -> i32 {
        let mut txstatus = -libc::EAGAIN;
        while txstatus == -libc::EAGAIN {
            let (cmd, data) = match rbuf.take_command() {
                Some(packet) => packet,
                None => break,
            };
            let br = self.io.br();
            if cmd == br.transaction_complete {
                trace!("> BR_TRANSACTION_COMPLETE");
                if reply.is_none() {
                    txstatus = STATUS_OK;
                }
            } else if cmd == br.dead_reply {
                trace!("> BR_DEAD_REPLY");
                txstatus = STATUS_DEAD_OBJECT;
            } else if cmd == br.failed_reply {
                trace!("> BR_FAILED_REPLY");
                txstatus = STATUS_FAILED;
            } else if cmd == br.reply {
                let tx = self.io.decode_transaction_data(&data);
                trace!("> BR_REPLY {} ({} bytes)", tx.status, tx.size);
                if let Some(buffer) = self.take_buffer(&tx) {
                    if let Some(reply) = reply.as_deref_mut() {
                        reply.set_data(buffer, Some(reg.clone()));
                    }
                    // With no waiting transactor the buffer is freed on drop
                }
                /*
                 * TF_STATUS_CODE payloads historically collide with
                 * delivery errors; map the ambiguous values to -EFAULT.
                 */
                txstatus = match tx.status {
                    s if s == -libc::EAGAIN || s == STATUS_FAILED ||
                        s == STATUS_DEAD_OBJECT => {
                        warn!("Replacing tx status {} with {}", s, -libc::EFAULT);
                        -libc::EFAULT
                    }
                    s => s,
                };
            } else {
                self.handle_command(rbuf, reg, handler, ctx, cmd, &data);
            }
        }
        rbuf.compact();
        txstatus
    }

    /// One blocking pass of the read loop: drain the kernel, dispatch every
    /// complete packet, repeat while a partial packet remains.
    pub(crate) fn read(self: &Arc<Self>, reg: &Arc<ObjectRegistry>,
        handler: Option<&dyn Handler>) -> i32 {
        let mut rbuf = ReadBuf::new();
        let mut ctx = Context::new();
        let mut ret = self.write_read_buf(None, &mut rbuf);
        if ret >= 0 {
            self.handle_commands(&mut rbuf, reg, handler, &mut ctx);
            while rbuf.has_pending() &&
                handler.map_or(false, |h| h.can_loop()) {
                ret = self.write_read_buf(None, &mut rbuf);
                if ret < 0 {
                    break;
                }
                self.handle_commands(&mut rbuf, reg, handler, &mut ctx);
            }
        }
        ret
    }

    /// Sends BC_TRANSACTION[_SG] and pumps the return stream until a
    /// terminal reply code arrives. A missing `reply` makes it a one-way
    /// transaction.
    pub(crate) fn transact(self: &Arc<Self>, reg: &Arc<ObjectRegistry>,
        handler: Option<&dyn Handler>, handle: u32, code: u32,
        req: &LocalRequest, mut reply: Option<&mut RemoteReply>) -> i32 {
        let mut rbuf = ReadBuf::new();
        let mut ctx = Context::new();
        let data = req.data();
        let flags = if reply.is_some() {
            TxFlags::empty()
        } else {
            TxFlags::ONEWAY
        };

        let mut bytes = [0u8; 4 + MAX_BC_TRANSACTION_SG_SIZE];
        let mut offsets_buf = Vec::new();
        let n = if data.buffers_size > 0 {
            trace!("< BC_TRANSACTION_SG 0x{:08x} 0x{:08x} {} bytes",
                handle, code, data.buffers_size);
            LE::write_u32(&mut bytes, self.io.bc().transaction_sg);
            self.io.encode_transaction_sg(&mut bytes[4..], handle, code,
                data.bytes, flags, data.offsets, &mut offsets_buf,
                data.buffers_size)
        } else {
            trace!("< BC_TRANSACTION 0x{:08x} 0x{:08x}", handle, code);
            LE::write_u32(&mut bytes, self.io.bc().transaction);
            self.io.encode_transaction(&mut bytes[4..], handle, code,
                data.bytes, flags, data.offsets, &mut offsets_buf)
        };
        let mut write = IoBuf::new(bytes.as_ptr(), 4 + n);

        /* Positive txstatus is the transaction status, negative is a
         * driver error, except -EAGAIN meaning no status yet. */
        let mut txstatus = -libc::EAGAIN;
        while txstatus == -libc::EAGAIN {
            let err = self.write_read_buf(Some(&mut write), &mut rbuf);
            txstatus = if err < 0 {
                err
            } else {
                self.txstatus(&mut rbuf, reg, handler, &mut ctx,
                    reply.as_deref_mut())
            };
        }

        if txstatus >= 0 {
            // Drain whatever else the kernel queued behind the reply
            self.handle_commands(&mut rbuf, reg, handler, &mut ctx);
            while rbuf.has_pending() {
                let err = self.write_read_buf(None, &mut rbuf);
                if err < 0 {
                    txstatus = err;
                    break;
                }
                self.handle_commands(&mut rbuf, reg, handler, &mut ctx);
            }
        }
        txstatus
    }

    /// A request pre-loaded with the device protocol's RPC header.
    pub fn local_request(&self, iface: Option<&str>) -> LocalRequest {
        match iface {
            Some(iface) => LocalRequest::with_header(self.io, self.protocol, iface),
            None => LocalRequest::new(self.io),
        }
    }

    /// The protocol's ping request.
    pub fn local_request_ping(&self) -> LocalRequest {
        let mut req = LocalRequest::new(self.io);
        self.protocol.write_ping(&mut req.writer());
        req
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        debug!("Closing {}", self.dev);
        unsafe {
            let _ = munmap(self.vm as *mut _, self.vmsize);
        }
        let _ = close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IO64;

    fn packet(cmd: u32, payload: &[u8]) -> Vec<u8> {
        assert_eq!(sys::ioc_size(cmd), payload.len());
        let mut out = cmd.to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn read_buf_framing() {
        let br = IO64.br();
        let mut rbuf = ReadBuf::new();
        rbuf.feed(&packet(br.noop, &[]));
        rbuf.feed(&packet(br.error, &(-5i32).to_le_bytes()));
        assert_eq!(rbuf.take_command(), Some((br.noop, vec![])));
        let (cmd, data) = rbuf.take_command().unwrap();
        assert_eq!(cmd, br.error);
        assert_eq!(data, (-5i32).to_le_bytes());
        assert_eq!(rbuf.take_command(), None);
        rbuf.compact();
        assert!(!rbuf.has_pending());
    }

    #[test]
    fn read_buf_partial_packet() {
        let br = IO64.br();
        let mut rbuf = ReadBuf::new();
        let full = packet(br.error, &7i32.to_le_bytes());
        // Only the command word and half the payload arrive
        rbuf.feed(&full[..6]);
        assert_eq!(rbuf.take_command(), None);
        rbuf.compact();
        assert!(rbuf.has_pending());
        // The rest shows up with the next ioctl
        rbuf.feed(&full[6..]);
        assert_eq!(rbuf.take_command(), Some((br.error, 7i32.to_le_bytes().to_vec())));
    }

    #[test]
    fn read_buf_compaction_moves_tail() {
        let br = IO64.br();
        let mut rbuf = ReadBuf::new();
        rbuf.feed(&packet(br.noop, &[]));
        let next = packet(br.error, &1i32.to_le_bytes());
        rbuf.feed(&next[..3]);
        assert_eq!(rbuf.take_command(), Some((br.noop, vec![])));
        assert_eq!(rbuf.take_command(), None);
        rbuf.compact();
        assert!(rbuf.has_pending());
        rbuf.feed(&next[3..]);
        let (cmd, data) = rbuf.take_command().unwrap();
        assert_eq!(cmd, br.error);
        assert_eq!(data, 1i32.to_le_bytes());
    }

    #[test]
    fn read_buf_short_of_header() {
        let mut rbuf = ReadBuf::new();
        rbuf.feed(&[0x01, 0x02]);
        assert_eq!(rbuf.take_command(), None);
        rbuf.compact();
        assert!(rbuf.has_pending());
    }
}
