//! Cursor over a received parcel.
//!
//! A reader pairs a byte cursor with an object cursor into the buffer's
//! offsets table. Typed object reads only succeed when the byte cursor sits
//! exactly on the next recorded object; every successful read advances the
//! byte cursor, object reads advance both. The reader is restartable only
//! through `copy()`.

use std::os::unix::io::RawFd;
use std::slice;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian as LE};
use log::warn;
use nix::fcntl::{fcntl, FcntlArg};

use crate::buffer::Buffer;
use crate::io::BufferObject;
use crate::object::RemoteObject;
use crate::registry::{ObjectRegistry, RemoteLookup};
use crate::sys;
use crate::writer::{Fds, FDS_HEADER_SIZE, HIDL_STRING_SIZE, HIDL_VEC_SIZE};

/// A validated hidl_vec payload: the element area plus its geometry.
pub struct HidlVec {
    pub data: Buffer,
    pub count: usize,
    pub elem_size: usize,
}

#[derive(Clone)]
pub struct Reader {
    buffer: Option<Buffer>,
    registry: Option<Arc<ObjectRegistry>>,
    start: u64,
    ptr: u64,
    end: u64,
    next_obj: usize,
}

impl Reader {
    pub fn empty() -> Self {
        Reader {
            buffer: None,
            registry: None,
            start: 0,
            ptr: 0,
            end: 0,
            next_obj: 0,
        }
    }

    pub(crate) fn new(buffer: Buffer, registry: Option<Arc<ObjectRegistry>>) -> Self {
        let start = buffer.addr();
        let end = start + buffer.len() as u64;
        Reader {
            buffer: Some(buffer),
            registry,
            start,
            ptr: start,
            end,
            next_obj: 0,
        }
    }

    /// Clones the cursor state; the original is unaffected.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn at_end(&self) -> bool {
        self.ptr >= self.end
    }

    pub fn bytes_read(&self) -> usize {
        (self.ptr - self.start) as usize
    }

    pub fn bytes_remaining(&self) -> usize {
        (self.end - self.ptr) as usize
    }

    fn can_read(&self, len: usize) -> bool {
        self.bytes_remaining() >= len
    }

    fn peek(&self, len: usize) -> &[u8] {
        if len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.ptr as *const u8, len) }
        }
    }

    /// True when the byte cursor sits exactly on the next recorded object.
    fn at_object(&self) -> bool {
        match &self.buffer {
            Some(buffer) => {
                let objects = buffer.contents().objects();
                self.next_obj < objects.len() && objects[self.next_obj] == self.ptr
            }
            None => false,
        }
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        if self.can_read(1) {
            let value = self.peek(1)[0];
            self.ptr += 1;
            Some(value)
        } else {
            None
        }
    }

    /// Booleans are padded to a 4-byte boundary on the wire.
    pub fn read_bool(&mut self) -> Option<bool> {
        if self.can_read(4) {
            let value = self.peek(1)[0] != 0;
            self.ptr += 4;
            Some(value)
        } else {
            None
        }
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        if self.can_read(4) {
            let value = LE::read_u32(self.peek(4));
            self.ptr += 4;
            Some(value)
        } else {
            None
        }
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        if self.can_read(8) {
            let value = LE::read_u64(self.peek(8));
            self.ptr += 8;
            Some(value)
        } else {
            None
        }
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.read_u64().map(|v| v as i64)
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        self.read_u32().map(f32::from_bits)
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        self.read_u64().map(f64::from_bits)
    }

    /// NUL-terminated UTF-8 padded to 4 bytes, as append_string8 writes it.
    pub fn read_string8(&mut self) -> Option<String> {
        let remaining = self.bytes_remaining();
        let data = self.peek(remaining);
        let len = data.iter().position(|b| *b == 0)?;
        let size = sys::align4(len + 1);
        if size <= remaining {
            let s = std::str::from_utf8(&data[..len]).ok()?.to_string();
            self.ptr += size as u64;
            Some(s)
        } else {
            None
        }
    }

    /// Distinguishes a null string (Some(None)) from a parse failure (None).
    pub fn read_nullable_string16(&mut self) -> Option<Option<String>> {
        match self.read_nullable_string16_utf16()? {
            Some(units) => Some(Some(String::from_utf16(&units).ok()?)),
            None => Some(None),
        }
    }

    pub fn read_nullable_string16_utf16(&mut self) -> Option<Option<Vec<u16>>> {
        if !self.can_read(4) {
            return None;
        }
        let len = LE::read_i32(self.peek(4));
        if len == -1 {
            self.ptr += 4;
            return Some(None);
        }
        if len < 0 {
            return None;
        }
        let padded = sys::align4((len as usize + 1) * 2);
        if !self.can_read(4 + padded) {
            return None;
        }
        let data = &self.peek(4 + padded)[4..];
        let units = (0..len as usize)
            .map(|i| LE::read_u16(&data[i * 2..]))
            .collect();
        self.ptr += (4 + padded) as u64;
        Some(Some(units))
    }

    pub fn read_string16(&mut self) -> Option<String> {
        self.read_nullable_string16()?
    }

    pub fn skip_string16(&mut self) -> bool {
        self.read_nullable_string16_utf16().is_some()
    }

    /// i32 length prefix then payload; a non-positive prefix reads as empty.
    pub fn read_byte_array(&mut self) -> Option<Vec<u8>> {
        if !self.can_read(4) {
            return None;
        }
        let len = LE::read_i32(self.peek(4));
        if len <= 0 {
            self.ptr += 4;
            return Some(Vec::new());
        }
        let len = len as usize;
        if !self.can_read(4 + len) {
            return None;
        }
        let data = self.peek(4 + len)[4..].to_vec();
        self.ptr += (4 + len) as u64;
        Some(data)
    }

    /// AIDL parcelable framing; Some(None) is a null parcelable.
    pub fn read_parcelable(&mut self) -> Option<Option<Vec<u8>>> {
        match self.read_i32()? {
            0 => Some(None),
            1 => {
                let size = self.read_i32()?;
                if size < 4 {
                    return None;
                }
                let payload = (size - 4) as usize;
                if !self.can_read(payload) {
                    return None;
                }
                let data = self.peek(payload).to_vec();
                self.ptr += payload as u64;
                Some(Some(data))
            }
            _ => None,
        }
    }

    fn read_fd_impl(&mut self, transfer_ownership: bool) -> Option<RawFd> {
        if !self.at_object() {
            return None;
        }
        let buffer = self.buffer.as_ref()?;
        let io = buffer.contents().io();
        let remaining = self.bytes_remaining();
        let (fd, eaten) = io.decode_fd_object(self.peek(remaining))?;
        if transfer_ownership {
            buffer.contents().mark_fd_consumed(self.ptr);
        }
        self.ptr += eaten as u64;
        self.next_obj += 1;
        Some(fd)
    }

    /// Reads an FD object, transferring ownership of the descriptor to the
    /// caller (the buffer will no longer close it).
    pub fn read_fd(&mut self) -> Option<RawFd> {
        self.read_fd_impl(true)
    }

    /// Reads an FD object and returns a duplicate; the original stays owned
    /// by (and dies with) the buffer.
    pub fn read_dup_fd(&mut self) -> Option<RawFd> {
        let fd = self.read_fd_impl(false)?;
        match fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(0)) {
            Ok(dupfd) => Some(dupfd),
            Err(err) => {
                warn!("Error dupping fd {}: {}", fd, err);
                None
            }
        }
    }

    /// Some(None) is an encoded null reference; None is a parse failure.
    pub fn read_nullable_object(&mut self) -> Option<Option<Arc<RemoteObject>>> {
        if !self.at_object() {
            return None;
        }
        let buffer = self.buffer.as_ref()?;
        let registry = self.registry.as_ref()?;
        let io = buffer.contents().io();
        let remaining = self.bytes_remaining();
        let (obj, eaten) = io.decode_binder_object(self.peek(remaining))?;
        self.ptr += eaten as u64;
        self.next_obj += 1;
        match obj {
            crate::io::FlatObject::Handle(handle) => {
                Some(registry.get_remote(handle, RemoteLookup::CreateAndAcquire))
            }
            crate::io::FlatObject::Null => Some(None),
        }
    }

    pub fn read_object(&mut self) -> Option<Arc<RemoteObject>> {
        self.read_nullable_object().flatten()
    }

    fn read_buffer_object(&mut self) -> Option<BufferObject> {
        if !self.at_object() {
            return None;
        }
        let buffer = self.buffer.as_ref()?;
        let io = buffer.contents().io();
        let remaining = self.bytes_remaining();
        let (obj, eaten) = io.decode_buffer_object(self.peek(remaining))?;
        self.ptr += eaten as u64;
        self.next_obj += 1;
        Some(obj)
    }

    /// Reads a buffer object as a child Buffer sharing ownership with the
    /// transaction.
    pub fn read_buffer(&mut self) -> Option<Buffer> {
        let obj = self.read_buffer_object()?;
        let parent = self.buffer.as_ref()?;
        Some(Buffer::new_with_parent(parent, obj.data, obj.size))
    }

    pub fn skip_buffer(&mut self) -> bool {
        self.read_buffer_object().is_some()
    }

    /// Reads a buffer object that must carry exactly `size` bytes.
    pub fn read_hidl_struct(&mut self, size: usize) -> Option<Buffer> {
        let obj = self.read_buffer_object()?;
        if obj.size == size && obj.data != 0 {
            let parent = self.buffer.as_ref()?;
            Some(Buffer::new_with_parent(parent, obj.data, obj.size))
        } else {
            None
        }
    }

    /// Validates the two-buffer-object pattern of a hidl_vec: the header,
    /// then the payload with matching parent linkage and a size consistent
    /// with the element count.
    pub fn read_hidl_vec(&mut self) -> Option<HidlVec> {
        let header = self.read_buffer_object()?;
        if header.data == 0 || header.size != HIDL_VEC_SIZE {
            return None;
        }
        let desc = unsafe {
            slice::from_raw_parts(header.data as *const u8, HIDL_VEC_SIZE)
        };
        let data_ptr = LE::read_u64(&desc[0..]);
        let count = LE::read_u32(&desc[8..]) as usize;
        let parent = self.buffer.as_ref()?.clone();
        if data_ptr == 0 {
            if count == 0 {
                return Some(HidlVec {
                    data: Buffer::new_with_parent(&parent, 0, 0),
                    count: 0,
                    elem_size: 0,
                });
            }
            return None;
        }
        let payload = self.read_buffer_object()?;
        if payload.data != data_ptr {
            return None;
        }
        let consistent = (count == 0 && payload.size == 0) ||
            (count != 0 && payload.size != 0 && payload.size % count == 0);
        if !consistent {
            return None;
        }
        Some(HidlVec {
            data: Buffer::new_with_parent(&parent, payload.data, payload.size),
            count,
            elem_size: if count > 0 { payload.size / count } else { 0 },
        })
    }

    fn validate_hidl_string(parent_offset_base: usize, obj: &BufferObject,
        str_desc: &[u8]) -> Option<String> {
        let data_ptr = LE::read_u64(&str_desc[0..]);
        let len = LE::read_u32(&str_desc[8..]) as usize;
        if obj.has_parent &&
            obj.parent_offset == parent_offset_base &&
            obj.data == data_ptr &&
            obj.size == len + 1 {
            let bytes = unsafe {
                slice::from_raw_parts(obj.data as *const u8, obj.size)
            };
            if bytes[len] == 0 {
                return std::str::from_utf8(&bytes[..len]).ok().map(String::from);
            }
        }
        None
    }

    pub fn read_hidl_string(&mut self) -> Option<String> {
        let header = self.read_buffer_object()?;
        if header.data == 0 || header.size != HIDL_STRING_SIZE {
            return None;
        }
        let desc = unsafe {
            slice::from_raw_parts(header.data as *const u8, HIDL_STRING_SIZE)
        };
        let payload = self.read_buffer_object()?;
        Self::validate_hidl_string(0, &payload, desc)
    }

    pub fn read_hidl_string_vec(&mut self) -> Option<Vec<String>> {
        let header = self.read_buffer_object()?;
        if header.data == 0 || header.size != HIDL_VEC_SIZE {
            warn!("Invalid hidl_vec<string>");
            return None;
        }
        let desc = unsafe {
            slice::from_raw_parts(header.data as *const u8, HIDL_VEC_SIZE)
        };
        let data_ptr = LE::read_u64(&desc[0..]);
        let count = LE::read_u32(&desc[8..]) as usize;
        if data_ptr == 0 && count == 0 {
            // An empty vector still carries its (null) payload object
            self.skip_buffer();
            return Some(Vec::new());
        }
        let strings = self.read_buffer_object()?;
        if !strings.has_parent || strings.data != data_ptr ||
            strings.size != count * HIDL_STRING_SIZE {
            warn!("Invalid hidl_vec<string>");
            return None;
        }
        let descs = unsafe {
            slice::from_raw_parts(strings.data as *const u8, strings.size)
        };
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let str_desc = &descs[i * HIDL_STRING_SIZE..(i + 1) * HIDL_STRING_SIZE];
            let obj = match self.read_buffer_object() {
                Some(obj) => obj,
                None => {
                    warn!("Invalid hidl_vec<string>");
                    return None;
                }
            };
            match Self::validate_hidl_string(i * HIDL_STRING_SIZE, &obj, str_desc) {
                Some(s) => out.push(s),
                None => {
                    warn!("Unexpected hidl_string buffer");
                    return None;
                }
            }
        }
        Some(out)
    }

    /// Reads a serialized queue descriptor: the 32-byte struct, the
    /// parented grantor vector and the fds block. The returned descriptors
    /// are owned by the caller (the kernel installed them for us).
    pub fn read_fmq_descriptor(&mut self) -> Option<crate::fmq::MqDescriptor> {
        use crate::fmq::{GrantorDescriptor, MqDescriptor,
            GRANTOR_DESCRIPTOR_SIZE, MQ_DESCRIPTOR_SIZE,
            MQ_DESCRIPTOR_GRANTORS_OFFSET};

        let header = self.read_buffer_object()?;
        if header.data == 0 || header.size != MQ_DESCRIPTOR_SIZE {
            return None;
        }
        let desc = unsafe {
            slice::from_raw_parts(header.data as *const u8, MQ_DESCRIPTOR_SIZE)
        };
        let grantor_ptr = LE::read_u64(&desc[0..]);
        let count = LE::read_u32(&desc[8..]) as usize;
        let quantum = LE::read_u32(&desc[24..]);
        let flags = LE::read_u32(&desc[28..]);

        let grantors_obj = self.read_buffer_object()?;
        if !grantors_obj.has_parent ||
            grantors_obj.parent_offset != MQ_DESCRIPTOR_GRANTORS_OFFSET ||
            grantors_obj.data != grantor_ptr ||
            grantors_obj.size != count * GRANTOR_DESCRIPTOR_SIZE {
            warn!("Invalid queue descriptor");
            return None;
        }
        let grantor_bytes = unsafe {
            slice::from_raw_parts(grantors_obj.data as *const u8,
                grantors_obj.size)
        };
        let grantors = (0..count)
            .map(|i| {
                let entry = &grantor_bytes[i * GRANTOR_DESCRIPTOR_SIZE..];
                GrantorDescriptor {
                    flags: LE::read_u32(&entry[0..]),
                    fd_index: LE::read_u32(&entry[4..]),
                    offset: LE::read_u32(&entry[8..]),
                    extent: LE::read_u64(&entry[16..]),
                }
            })
            .collect();

        let fds = self.read_fds()?;
        Some(MqDescriptor {
            grantors,
            fds: Fds { fds, ints: Vec::new() },
            quantum,
            flags,
        })
    }

    /// Reads a serialized fds block (size prefix, parented buffer,
    /// FD_ARRAY object) and returns the descriptors it carries.
    pub(crate) fn read_fds(&mut self) -> Option<Vec<RawFd>> {
        let total = self.read_i64()?;
        if total == 0 {
            return Some(Vec::new());
        }
        let block = self.read_buffer_object()?;
        if block.size != total as usize || block.size < FDS_HEADER_SIZE {
            return None;
        }
        let data = unsafe {
            slice::from_raw_parts(block.data as *const u8, block.size)
        };
        let num_fds = LE::read_u32(&data[4..]) as usize;
        if FDS_HEADER_SIZE + num_fds * 4 > block.size {
            return None;
        }
        // Swallow the FD_ARRAY object that follows the block
        if self.at_object() {
            let buffer = self.buffer.as_ref()?;
            let io = buffer.contents().io();
            let remaining = self.bytes_remaining();
            let eaten = io.object_size(self.peek(remaining));
            if eaten == 0 {
                return None;
            }
            self.ptr += eaten as u64;
            self.next_obj += 1;
        }
        let mut fds = Vec::with_capacity(num_fds);
        for i in 0..num_fds {
            fds.push(LE::read_i32(&data[FDS_HEADER_SIZE + i * 4..]));
        }
        Some(fds)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Reader;
    use crate::buffer::{Buffer, BufferContents};
    use crate::io::IO64;
    use crate::writer::WriterData;

    /// Turns a locally built parcel into a received-looking buffer. The
    /// WriterData must outlive the Buffer, since embedded buffer objects
    /// point into its arena.
    pub(crate) fn buffer_from(data: &WriterData) -> Buffer {
        let bytes: Box<[u8]> = data.output().bytes.into();
        let base = bytes.as_ptr() as u64;
        let objects = data.output().offsets.iter()
            .map(|off| base + *off as u64)
            .collect();
        Buffer::from_contents(BufferContents::new_heap(&IO64, bytes, objects))
    }

    pub(crate) fn reader_for(data: &WriterData) -> Reader {
        Reader::new(buffer_from(data), None)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::reader_for;
    use super::*;
    use crate::writer::{Writer, WriterData};
    use crate::io::IO64;

    #[test]
    fn primitive_roundtrip() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_bool(true);
        w.append_i32(-42);
        w.append_i64(1 << 40);
        w.append_f32(1.5);
        w.append_f64(-2.25);
        let mut r = reader_for(&data);
        assert_eq!(r.read_bool(), Some(true));
        assert_eq!(r.read_i32(), Some(-42));
        assert_eq!(r.read_i64(), Some(1 << 40));
        assert_eq!(r.read_f32(), Some(1.5));
        assert_eq!(r.read_f64(), Some(-2.25));
        assert!(r.at_end());
        assert_eq!(r.read_i32(), None);
    }

    #[test]
    fn string8_roundtrip() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_string8(Some("test"));
        w.append_i32(7);
        let mut r = reader_for(&data);
        assert_eq!(r.read_string8().as_deref(), Some("test"));
        assert_eq!(r.read_i32(), Some(7));
    }

    #[test]
    fn string16_roundtrip() {
        for s in ["test", "", "p\u{00e4}iv\u{00e4}\u{00e4}"].iter() {
            let mut data = WriterData::new(&IO64);
            let mut w = Writer::new(&mut data);
            w.append_string16(Some(s));
            let mut r = reader_for(&data);
            assert_eq!(r.read_string16().as_deref(), Some(*s));
            assert!(r.at_end());
        }
        // Null
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_string16(None);
        let mut r = reader_for(&data);
        assert_eq!(r.read_nullable_string16(), Some(None));
    }

    #[test]
    fn byte_array_roundtrip() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_byte_array(&[1, 2, 3, 4, 5]);
        let mut r = reader_for(&data);
        assert_eq!(r.read_byte_array(), Some(vec![1, 2, 3, 4, 5]));
        // Padding bytes remain
        assert_eq!(r.bytes_remaining(), 3);
    }

    #[test]
    fn parcelable_roundtrip() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_parcelable(Some(&[8, 8, 8, 8]));
        w.append_parcelable(None);
        let mut r = reader_for(&data);
        assert_eq!(r.read_parcelable(), Some(Some(vec![8, 8, 8, 8])));
        assert_eq!(r.read_parcelable(), Some(None));
    }

    #[test]
    fn hidl_string_roundtrip() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_hidl_string(Some("hello"));
        let mut r = reader_for(&data);
        assert_eq!(r.read_hidl_string().as_deref(), Some("hello"));
        assert!(r.at_end());
    }

    #[test]
    fn hidl_string_vec_roundtrip() {
        let strv = ["hello", "world", ""];
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_hidl_string_vec(&strv);
        let mut r = reader_for(&data);
        let read = r.read_hidl_string_vec().unwrap();
        assert_eq!(read, vec!["hello", "world", ""]);
        assert!(r.at_end());
    }

    #[test]
    fn empty_hidl_string_vec() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_hidl_string_vec(&[]);
        let mut r = reader_for(&data);
        assert_eq!(r.read_hidl_string_vec(), Some(Vec::new()));
        assert!(r.at_end());
    }

    #[test]
    fn hidl_vec_geometry() {
        let elems: Vec<u8> = (0..12).collect();
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_hidl_vec(&elems, 3, 4);
        let mut r = reader_for(&data);
        let vec = r.read_hidl_vec().unwrap();
        assert_eq!(vec.count, 3);
        assert_eq!(vec.elem_size, 4);
        assert_eq!(vec.data.as_slice(), &elems[..]);
    }

    #[test]
    fn hidl_struct_size_check() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_buffer_object(&[0u8; 24], None);
        let mut r = reader_for(&data);
        assert!(r.copy().read_hidl_struct(16).is_none());
        assert!(r.read_hidl_struct(24).is_some());
    }

    #[test]
    fn buffer_subslice() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_buffer_object(&[9u8; 8], None);
        let mut r = reader_for(&data);
        let buf = r.read_buffer().unwrap();
        assert_eq!(buf.as_slice(), &[9u8; 8]);
    }

    #[test]
    fn object_reads_require_object_position() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_i32(1);
        w.append_buffer_object(&[0u8; 8], None);
        let mut r = reader_for(&data);
        // Not at an object yet
        assert!(r.copy().read_buffer().is_none());
        assert_eq!(r.read_i32(), Some(1));
        assert!(r.read_buffer().is_some());
    }

    #[test]
    fn copy_preserves_cursor() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_i32(1);
        w.append_i32(2);
        let mut r = reader_for(&data);
        assert_eq!(r.read_i32(), Some(1));
        let mut snapshot = r.copy();
        assert_eq!(r.read_i32(), Some(2));
        assert_eq!(snapshot.read_i32(), Some(2));
    }

    #[test]
    fn fds_block_roundtrip() {
        use crate::writer::Fds;
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        let fds = Fds { fds: vec![3, 4], ints: vec![] };
        w.append_fds(Some(&fds), None);
        let mut r = reader_for(&data);
        assert_eq!(r.read_fds(), Some(vec![3, 4]));
        assert!(r.at_end());
    }
}
