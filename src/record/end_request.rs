use super::protocol_status::ProtocolStatus;
use std::io::{self, Write};

/// The 8-byte body of an `FCGI_END_REQUEST` record.
///
/// Only the low byte of `app_status` is ever populated by this responder
/// (§4.C), but the wire field is a full 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u8,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub fn new(app_status: u8, protocol_status: ProtocolStatus) -> Self {
        EndRequestBody {
            app_status,
            protocol_status,
        }
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[0, 0, 0, self.app_status])?;
        writer.write_all(&[self.protocol_status.id(), 0, 0, 0])
    }
}
