//! Request parcels: one being built locally, one received from a peer.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::io::Io;
use crate::looper::{LooperTx, PendingReply};
use crate::protocol::RpcProtocol;
use crate::reader::Reader;
use crate::registry::ObjectRegistry;
use crate::writer::{OutputData, Writer, WriterData};

/// A request under construction, to be sent with BC_TRANSACTION.
pub struct LocalRequest {
    data: WriterData,
}

impl LocalRequest {
    pub fn new(io: &'static dyn Io) -> Self {
        LocalRequest { data: WriterData::new(io) }
    }

    /// A request starting with the protocol's RPC header for `iface`.
    pub fn with_header(io: &'static dyn Io, protocol: &'static dyn RpcProtocol,
        iface: &str) -> Self {
        let mut req = LocalRequest::new(io);
        protocol.write_rpc_header(&mut req.writer(), iface);
        req
    }

    pub fn writer(&mut self) -> Writer<'_> {
        Writer::new(&mut self.data)
    }

    pub(crate) fn data(&self) -> OutputData<'_> {
        self.data.output()
    }
}

/// An incoming BR_TRANSACTION: payload cursor plus sender metadata, and the
/// hook into the looper transaction that delivered it.
pub struct RemoteRequest {
    reader: Reader,
    protocol: &'static dyn RpcProtocol,
    pid: u32,
    euid: u32,
    iface: Option<String>,
    pub(crate) tx: Option<Arc<LooperTx>>,
}

impl RemoteRequest {
    pub(crate) fn new(protocol: &'static dyn RpcProtocol, pid: u32, euid: u32) -> Self {
        RemoteRequest {
            reader: Reader::empty(),
            protocol,
            pid,
            euid,
            iface: None,
            tx: None,
        }
    }

    /// Attaches the received payload and parses the RPC header, leaving the
    /// cursor on the first payload item.
    pub(crate) fn set_data(&mut self, code: u32, buffer: Buffer,
        registry: Option<Arc<ObjectRegistry>>) {
        self.reader = Reader::new(buffer, registry);
        self.iface = self.protocol.read_rpc_header(&mut self.reader, code);
    }

    /// The interface name carried by the RPC header, if any.
    pub fn interface(&self) -> Option<&str> {
        self.iface.as_deref()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn euid(&self) -> u32 {
        self.euid
    }

    pub fn reader(&mut self) -> &mut Reader {
        &mut self.reader
    }

    /// Tells the looper that the reply will be produced asynchronously.
    /// Returns the completion token; the transaction stays open until
    /// `PendingReply::complete` is called. Only meaningful inside a
    /// transaction handler.
    pub fn block(&mut self) -> Option<PendingReply> {
        let tx = self.tx.as_ref()?;
        tx.block()
    }
}
