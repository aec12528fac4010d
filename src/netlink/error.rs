use genetlink::GenetlinkError;
use netlink_packet_utils::errors::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("No such interface")]
    NotFound,
    #[error("Operation not permitted")]
    PermissionDenied,
    #[error("Unknown error: {0}")]
    Unknown(i32),
    #[error("Netlink io error: {0}")]
    NetlinkIo(#[from] std::io::Error),
    #[error("Netlink decode error: {0}")]
    NetlinkDecode(#[from] DecodeError),
    #[error("Genetlink error: {0}")]
    Genetlink(#[from] GenetlinkError),
    #[error("Netlink unexpected response")]
    UnexpectedResponse,
}

impl From<i32> for NetlinkError {
    fn from(i: i32) -> Self {
        match i {
            -1 => Self::PermissionDenied,
            -19 | -2 => Self::NotFound,
            i => Self::Unknown(i),
        }
    }
}
