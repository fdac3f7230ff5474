//! Userspace client/server library for the Android binder IPC driver.
//!
//! The crate opens a binder device, publishes local objects, talks to
//! remote ones and moves parcels, file descriptors, death notifications
//! and fast message queues between processes. The servicemanager protocol
//! itself is out of scope; this is the transport it runs on.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate num_derive;

mod buffer;
mod cleanup;
mod driver;
mod eventloop;
mod fmq;
mod io;
mod ipc;
mod looper;
mod object;
mod parcelable;
mod protocol;
mod reader;
mod registry;
mod reply;
mod request;
mod sys;
mod writer;

pub use buffer::Buffer;
pub use driver::Driver;
pub use eventloop::{set_dispatcher, EventDispatcher};
pub use fmq::{Fmq, FmqFlags, FmqType, GrantorDescriptor, MqDescriptor};
pub use io::{for_version, Io, Parent, IO32, IO64};
pub use ipc::{ipc_exit, Ipc};
pub use looper::PendingReply;
pub use object::{LocalObject, RemoteObject, TransactionSupport};
pub use parcelable::{Parcelable, String16};
pub use protocol::{by_name as protocol_by_name, for_device as protocol_for_device,
    RpcProtocol, AIDL, HIDL};
pub use reader::{HidlVec, Reader};
pub use registry::{ObjectRegistry, RemoteLookup};
pub use reply::{LocalReply, RemoteReply};
pub use request::{LocalRequest, RemoteRequest};
pub use sys::{TxFlags, DEFAULT_BINDER_DEVICE, DEFAULT_HWBINDER_DEVICE};
pub use writer::{Fds, Writer, WriterField, WriterFieldKind, WriterType,
    TYPE_BYTE, TYPE_HIDL_STRING, TYPE_INT32};

// The derive lives in its own proc-macro crate; same name, different
// namespace than the trait.
pub use parcelable_derive::Parcelable as DeriveParcelable;

use thiserror::Error as ThisError;

/// Transaction status values. Zero is success, small positive values are
/// the delivery failures below, anything negative is an errno.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Status {
    Ok = 0,
    Failed = 1,
    DeadObject = 2,
}

impl Status {
    pub fn from_code(code: i32) -> Option<Status> {
        num_traits::FromPrimitive::from_i32(code)
    }
}

pub const STATUS_OK: i32 = Status::Ok as i32;
pub const STATUS_FAILED: i32 = Status::Failed as i32;
pub const STATUS_DEAD_OBJECT: i32 = Status::DeadObject as i32;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("stdio error")]
    StdioError(#[from] std::io::Error),
    #[error("utf error")]
    Utf16Error(#[from] std::string::FromUtf16Error),
    #[error("utf error")]
    Utf8Error(#[from] std::string::FromUtf8Error),
    #[error("system error")]
    SystemError(#[from] nix::Error),
    #[error("unsupported binder protocol version {0}")]
    UnsupportedVersion(i32),
    #[error("transaction failed with status {0}")]
    TransactionError(i32),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("deserialization error")]
    DeserializationError,
    #[error("bad enum value")]
    BadEnumValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(STATUS_OK, 0);
        assert_eq!(STATUS_FAILED, 1);
        assert_eq!(STATUS_DEAD_OBJECT, 2);
        assert_eq!(Status::from_code(2), Some(Status::DeadObject));
        assert_eq!(Status::from_code(-22), None);
    }
}
