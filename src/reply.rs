//! Reply parcels: one being built locally, one received from a peer.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::io::Io;
use crate::reader::Reader;
use crate::registry::ObjectRegistry;
use crate::writer::{OutputData, Writer, WriterData};

/// A reply under construction, to be sent back with BC_REPLY.
pub struct LocalReply {
    data: WriterData,
}

impl LocalReply {
    pub fn new(io: &'static dyn Io) -> Self {
        LocalReply { data: WriterData::new(io) }
    }

    pub fn writer(&mut self) -> Writer<'_> {
        Writer::new(&mut self.data)
    }

    pub(crate) fn data(&self) -> OutputData<'_> {
        self.data.output()
    }
}

/// A received BR_REPLY payload.
pub struct RemoteReply {
    reader: Reader,
    empty: bool,
}

impl RemoteReply {
    pub(crate) fn new() -> Self {
        RemoteReply { reader: Reader::empty(), empty: true }
    }

    pub(crate) fn set_data(&mut self, buffer: Buffer,
        registry: Option<Arc<ObjectRegistry>>) {
        self.empty = buffer.is_empty();
        self.reader = Reader::new(buffer, registry);
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn reader(&mut self) -> &mut Reader {
        &mut self.reader
    }
}
