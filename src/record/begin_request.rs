use super::role::Role;
use crate::error::Error;

const MASK_FCGI_KEEP_CONN: u8 = 0x01;

/// Reads the `FCGI_KEEP_CONN` bit out of a raw flags byte, for callers that
/// only have `decode_raw`'s flags (the role was rejected before a
/// [`BeginRequestBody`] could be built).
pub fn keep_conn_flag(flags: u8) -> bool {
    flags & MASK_FCGI_KEEP_CONN != 0
}

/// The 8-byte body of an `FCGI_BEGIN_REQUEST` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: Role,
    flags: u8,
}

impl BeginRequestBody {
    pub fn keep_conn(&self) -> bool {
        self.flags & MASK_FCGI_KEEP_CONN != 0
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let (role_id, flags) = Self::decode_raw(bytes)?;
        let role = Role::from_id(role_id)?;
        Ok(BeginRequestBody { role, flags })
    }

    /// Reads the role id and flags byte without validating the role,
    /// so a caller can still answer an unsupported role with the correct
    /// `FCGI_KEEP_CONN` bit instead of dropping it along with the error.
    pub fn decode_raw(bytes: &[u8]) -> Result<(u16, u8), Error> {
        if bytes.len() < 8 {
            return Err(Error::MalformedRecordPayload("BeginRequest"));
        }
        Ok((u16::from_be_bytes([bytes[0], bytes[1]]), bytes[2]))
    }
}
