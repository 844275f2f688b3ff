use crate::error::Error;

/// The `protocolStatus` byte of an `FCGI_END_REQUEST` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    /// Normal end of request.
    RequestComplete,
    /// The application does not support multiplexing requests on one connection.
    CantMpxConn,
    /// The application ran out of some resource (unused by this responder).
    Overloaded,
    /// `FCGI_BEGIN_REQUEST` specified a role the application does not support.
    UnknownRole,
}

impl ProtocolStatus {
    pub fn id(&self) -> u8 {
        match self {
            Self::RequestComplete => 0,
            Self::CantMpxConn => 1,
            Self::Overloaded => 2,
            Self::UnknownRole => 3,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(Self::RequestComplete),
            1 => Ok(Self::CantMpxConn),
            2 => Ok(Self::Overloaded),
            3 => Ok(Self::UnknownRole),
            other => Err(Error::UnsupportedProtocolStatus(other)),
        }
    }
}
