use thiserror::Error;

/// Failure of one connection attempt or one data channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("operation timed out")]
    Timeout,
    #[error("channel closed")]
    ChannelClosed,
    #[error("connection closed")]
    Closed,
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay closed")]
    Closed,
    #[error("failed to encode relay frame: {0}")]
    Encode(String),
    /// The receiver's heartbeat was absent for the whole delivery cutoff.
    #[error("NO_RESPONSE from {receiver} after {attempts} sends")]
    NoResponse { receiver: String, attempts: u32 },
}

/// Port-mapping failures. Callers log these; they never abort a connection attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("port mapping is not supported by the gateway")]
    Unsupported,
    #[error("port mapping table is full")]
    TableFull,
    #[error("port mapping failed: {0}")]
    Failed(String),
}

/// In-band refusal sent to a remote file requester instead of bytes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FileDenial {
    #[error("NO_PERMISSION")]
    NoPermission,
    #[error("NOT_FOUND")]
    NotFound,
}

impl FileDenial {
    pub fn as_code(self) -> &'static str {
        match self {
            FileDenial::NoPermission => "NO_PERMISSION",
            FileDenial::NotFound => "NOT_FOUND",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "NO_PERMISSION" => Some(FileDenial::NoPermission),
            "NOT_FOUND" => Some(FileDenial::NotFound),
            _ => None,
        }
    }
}

/// A control frame that could not be understood. Logged and dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("remote refused file: {0}")]
    Denied(#[from] FileDenial),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no connection attempt succeeded")]
    NoWinner,
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("invalid transfer description: {0}")]
    InvalidDescription(String),
    #[error("not in a group")]
    NotInGroup,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_codes_round_trip_and_reject_unknown() {
        for denial in [FileDenial::NoPermission, FileDenial::NotFound] {
            assert_eq!(FileDenial::from_code(denial.as_code()), Some(denial));
        }
        assert_eq!(FileDenial::from_code("END"), None);
        assert_eq!(FileDenial::NoPermission.to_string(), "NO_PERMISSION");
    }

    #[test]
    fn no_response_mentions_receiver() {
        let err = SignalingError::NoResponse {
            receiver: "peer-b".into(),
            attempts: 30,
        };
        assert_eq!(err.to_string(), "NO_RESPONSE from peer-b after 30 sends");
    }
}
