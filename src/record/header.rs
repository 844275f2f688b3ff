use crate::error::Error;

pub const VERSION: u8 = 1;

pub const TYPE_BEGIN_REQUEST: u8 = 1;
pub const TYPE_ABORT_REQUEST: u8 = 2;
pub const TYPE_END_REQUEST: u8 = 3;
pub const TYPE_PARAMS: u8 = 4;
pub const TYPE_STDIN: u8 = 5;
pub const TYPE_STDOUT: u8 = 6;

/// The 8-byte frame that precedes every FastCGI record.
///
/// `request_id` and `content_length` are each reassembled from a big-endian
/// hi/lo byte pair, per FastCGI/1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub type_id: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl Header {
    pub const LEN: usize = 8;

    pub fn decode(bytes: [u8; 8]) -> Result<Self, Error> {
        let [version, type_id, req_id_hi, req_id_lo, len_hi, len_lo, padding_length, _reserved] =
            bytes;

        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        Ok(Header {
            type_id,
            request_id: u16::from_be_bytes([req_id_hi, req_id_lo]),
            content_length: u16::from_be_bytes([len_hi, len_lo]),
            padding_length,
        })
    }

    pub fn encode(&self) -> [u8; 8] {
        let [req_hi, req_lo] = self.request_id.to_be_bytes();
        let [len_hi, len_lo] = self.content_length.to_be_bytes();
        [
            VERSION,
            self.type_id,
            req_hi,
            req_lo,
            len_hi,
            len_lo,
            self.padding_length,
            0,
        ]
    }
}
