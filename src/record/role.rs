use crate::error::Error;

/// The FastCGI role requested by `FCGI_BEGIN_REQUEST`.
///
/// Only `Responder` is ever accepted; `Authorizer` and `Filter` are decoded
/// so that an unsupported role can still be reported with the correct id in
/// the `END_REQUEST` that rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
}

impl Role {
    pub fn id(&self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
        }
    }

    pub fn from_id(id: u16) -> Result<Self, Error> {
        match id {
            1 => Ok(Self::Responder),
            2 => Ok(Self::Authorizer),
            3 => Ok(Self::Filter),
            other => Err(Error::UnsupportedRole(other)),
        }
    }

    pub fn supported(&self) -> bool {
        *self == Role::Responder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_responder_is_supported() {
        assert!(Role::Responder.supported());
        assert!(!Role::Authorizer.supported());
        assert!(!Role::Filter.supported());
    }

    #[test]
    fn unknown_ids_are_rejected() {
        assert!(Role::from_id(4).is_err());
    }
}
