use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Problem codes carried in `close` control messages and close events.
///
/// These are wire-visible strings: the spellings below are part of the
/// protocol and must not change. A `None` problem everywhere in this crate
/// means an orderly close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Problem {
    /// Framing or control-message validation failed. Fatal to the transport.
    ProtocolError,
    /// The peer asked for a payload type this side does not implement.
    NotSupported,
    NotFound,
    NotAuthorized,
    AccessDenied,
    AuthenticationFailed,
    UnknownHost,
    UnknownHostkey,
    InvalidHostkey,
    NoHost,
    /// The bridge program is not installed on the target host.
    NoBridge,
    /// The process or connection was deliberately terminated.
    Terminated,
    /// The underlying transport went away.
    Disconnected,
    InternalError,
}

impl Problem {
    /// The wire spelling of this problem.
    pub fn as_str(&self) -> &'static str {
        match self {
            Problem::ProtocolError => "protocol-error",
            Problem::NotSupported => "not-supported",
            Problem::NotFound => "not-found",
            Problem::NotAuthorized => "not-authorized",
            Problem::AccessDenied => "access-denied",
            Problem::AuthenticationFailed => "authentication-failed",
            Problem::UnknownHost => "unknown-host",
            Problem::UnknownHostkey => "unknown-hostkey",
            Problem::InvalidHostkey => "invalid-hostkey",
            Problem::NoHost => "no-host",
            Problem::NoBridge => "no-bridge",
            Problem::Terminated => "terminated",
            Problem::Disconnected => "disconnected",
            Problem::InternalError => "internal-error",
        }
    }

    /// Classify an I/O error from a connect() attempt.
    pub fn from_connect_error(err: &std::io::Error) -> Problem {
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => Problem::NotAuthorized,
            Some(libc::ENOENT) => Problem::NotFound,
            _ => Problem::InternalError,
        }
    }

    /// Classify an I/O error from spawning a child process.
    pub fn from_spawn_error(err: &std::io::Error) -> Problem {
        match err.raw_os_error() {
            Some(libc::ENOENT) => Problem::NotFound,
            Some(libc::EACCES) | Some(libc::EPERM) => Problem::NotAuthorized,
            _ => Problem::InternalError,
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Problem {
    type Err = UnknownProblem;

    fn from_str(s: &str) -> Result<Self, UnknownProblem> {
        match s {
            "protocol-error" => Ok(Problem::ProtocolError),
            "not-supported" => Ok(Problem::NotSupported),
            "not-found" => Ok(Problem::NotFound),
            "not-authorized" => Ok(Problem::NotAuthorized),
            "access-denied" => Ok(Problem::AccessDenied),
            "authentication-failed" => Ok(Problem::AuthenticationFailed),
            "unknown-host" => Ok(Problem::UnknownHost),
            "unknown-hostkey" => Ok(Problem::UnknownHostkey),
            "invalid-hostkey" => Ok(Problem::InvalidHostkey),
            "no-host" => Ok(Problem::NoHost),
            "no-bridge" => Ok(Problem::NoBridge),
            "terminated" => Ok(Problem::Terminated),
            "disconnected" => Ok(Problem::Disconnected),
            "internal-error" => Ok(Problem::InternalError),
            other => Err(UnknownProblem(other.to_string())),
        }
    }
}

/// A problem string this implementation does not recognise.
#[derive(Debug, Error)]
#[error("unknown problem code: {0:?}")]
pub struct UnknownProblem(pub String);

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { length: usize, limit: usize },

    #[error("frame has no channel prefix")]
    MissingChannelPrefix,

    #[error("frame channel prefix is not a decimal channel id")]
    BadChannelPrefix,

    #[error("received truncated {0} byte frame")]
    Truncated(usize),
}

impl WireError {
    /// Every codec failure is fatal to the transport with the same problem.
    pub fn problem(&self) -> Problem {
        Problem::ProtocolError
    }
}

pub type Result<T, E = WireError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_spellings_round_trip() {
        let all = [
            Problem::ProtocolError,
            Problem::NotSupported,
            Problem::NotFound,
            Problem::NotAuthorized,
            Problem::AccessDenied,
            Problem::AuthenticationFailed,
            Problem::UnknownHost,
            Problem::UnknownHostkey,
            Problem::InvalidHostkey,
            Problem::NoHost,
            Problem::NoBridge,
            Problem::Terminated,
            Problem::Disconnected,
            Problem::InternalError,
        ];
        for problem in all {
            assert_eq!(problem.as_str().parse::<Problem>().unwrap(), problem);
        }
    }

    #[test]
    fn unknown_problem_is_rejected() {
        assert!("no-such-problem".parse::<Problem>().is_err());
    }

    #[test]
    fn connect_errno_classification() {
        let err = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(Problem::from_connect_error(&err), Problem::NotFound);
        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(Problem::from_connect_error(&err), Problem::NotAuthorized);
        let err = std::io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(Problem::from_connect_error(&err), Problem::InternalError);
    }
}
