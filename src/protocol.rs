//! Pluggable RPC header protocols.
//!
//! The driver and loopers never look inside an RPC header; they go through
//! this trait to write headers and pings and to pull the interface name out
//! of incoming requests. Two flavors are built in, matching the two stock
//! binder devices.

use crate::reader::Reader;
use crate::writer::Writer;

macro_rules! fourcc {
    ($c1:expr, $c2:expr, $c3:expr, $c4:expr) => {
        ((($c1 as u32) << 24) | (($c2 as u32) << 16) | (($c3 as u32) << 8) | ($c4 as u32))
    };
}

pub trait RpcProtocol: Send + Sync {
    fn name(&self) -> &'static str;
    /// Transaction code of the protocol's ping.
    fn ping_tx(&self) -> u32;
    /// Transaction code of the interface query probe, if the protocol has
    /// one. Answered inline on the looper thread.
    fn interface_request_tx(&self) -> Option<u32> {
        None
    }
    fn write_ping(&self, writer: &mut Writer);
    fn write_rpc_header(&self, writer: &mut Writer, iface: &str);
    /// Parses the header of an incoming request, returning the interface
    /// name and leaving the cursor on the first payload item.
    fn read_rpc_header(&self, reader: &mut Reader, txcode: u32) -> Option<String>;
}

/* The AIDL flavor: strict-mode word, unset work source, the 'SYST' header
 * marker and the UTF-16 interface name. */

const STRICT_MODE_PENALTY_GATHER: i32 = 1 << 31;
const BINDER_RPC_FLAGS: i32 = 0x42000004;
const UNSET_WORK_SOURCE: i32 = -1;
/// packed ['S', 'Y', 'S', 'T']
const HEADER: i32 = fourcc!(b'S', b'Y', b'S', b'T') as i32;

const PING_TRANSACTION: u32 = fourcc!(b'_', b'P', b'N', b'G');
const INTERFACE_TRANSACTION: u32 = fourcc!(b'_', b'N', b'T', b'F');
const HIDL_PING_TRANSACTION: u32 = fourcc!(0x0f, b'P', b'N', b'G');

const HIDL_BASE_INTERFACE: &str = "android.hidl.base@1.0::IBase";

pub struct AidlProtocol(());

impl RpcProtocol for AidlProtocol {
    fn name(&self) -> &'static str {
        "aidl"
    }

    fn ping_tx(&self) -> u32 {
        PING_TRANSACTION
    }

    fn interface_request_tx(&self) -> Option<u32> {
        Some(INTERFACE_TRANSACTION)
    }

    fn write_ping(&self, _writer: &mut Writer) {
        // An AIDL ping has an empty body
    }

    fn write_rpc_header(&self, writer: &mut Writer, iface: &str) {
        writer.append_i32(STRICT_MODE_PENALTY_GATHER | BINDER_RPC_FLAGS);
        writer.append_i32(UNSET_WORK_SOURCE);
        writer.append_i32(HEADER);
        writer.append_string16(Some(iface));
    }

    fn read_rpc_header(&self, reader: &mut Reader, _txcode: u32) -> Option<String> {
        reader.read_i32()?; // strict mode policy
        if reader.read_i32()? != UNSET_WORK_SOURCE {
            return None;
        }
        if reader.read_i32()? != HEADER {
            return None;
        }
        reader.read_string16()
    }
}

/* The HIDL flavor: the interface name as a plain UTF-8 string. */

pub struct HidlProtocol(());

impl RpcProtocol for HidlProtocol {
    fn name(&self) -> &'static str {
        "hidl"
    }

    fn ping_tx(&self) -> u32 {
        HIDL_PING_TRANSACTION
    }

    fn write_ping(&self, writer: &mut Writer) {
        self.write_rpc_header(writer, HIDL_BASE_INTERFACE);
    }

    fn write_rpc_header(&self, writer: &mut Writer, iface: &str) {
        writer.append_string8(Some(iface));
    }

    fn read_rpc_header(&self, reader: &mut Reader, _txcode: u32) -> Option<String> {
        reader.read_string8()
    }
}

pub static AIDL: AidlProtocol = AidlProtocol(());
pub static HIDL: HidlProtocol = HidlProtocol(());

pub fn by_name(name: &str) -> Option<&'static dyn RpcProtocol> {
    match name {
        "aidl" => Some(&AIDL),
        "hidl" => Some(&HIDL),
        _ => None,
    }
}

/// The protocol spoken on a device, from its path. Path is configuration,
/// not policy; hwbinder devices talk HIDL, everything else AIDL.
pub fn for_device(dev: &str) -> &'static dyn RpcProtocol {
    if dev.contains("hwbinder") {
        &HIDL
    } else {
        &AIDL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IO64;
    use crate::reader::testutil::reader_for;
    use crate::writer::{Writer, WriterData};

    #[test]
    fn aidl_header_roundtrip() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        AIDL.write_rpc_header(&mut w, "com.example.IEcho");
        w.append_i32(33);
        let mut r = reader_for(&data);
        let iface = AIDL.read_rpc_header(&mut r, 1);
        assert_eq!(iface.as_deref(), Some("com.example.IEcho"));
        assert_eq!(r.read_i32(), Some(33));
    }

    #[test]
    fn hidl_header_roundtrip() {
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        HIDL.write_rpc_header(&mut w, "android.hardware.nfc@1.0::INfc");
        let mut r = reader_for(&data);
        let iface = HIDL.read_rpc_header(&mut r, 1);
        assert_eq!(iface.as_deref(), Some("android.hardware.nfc@1.0::INfc"));
    }

    #[test]
    fn device_mapping() {
        assert_eq!(for_device("/dev/binder").name(), "aidl");
        assert_eq!(for_device("/dev/hwbinder").name(), "hidl");
        assert_eq!(for_device("/dev/vndbinder").name(), "aidl");
        assert!(by_name("aidl").is_some());
        assert!(by_name("midl").is_none());
    }

    #[test]
    fn ping_codes() {
        assert_eq!(AIDL.ping_tx(), 0x5f504e47);
        assert_eq!(HIDL.ping_tx(), 0x0f504e47);
        assert_eq!(AIDL.interface_request_tx(), Some(0x5f4e5446));
    }
}
