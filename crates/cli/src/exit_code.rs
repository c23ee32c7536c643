// Consistent exit codes for the taskdeck CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/configuration error
//   10 = backend not reachable
//   12 = request rejected by the backend
//   13 = network error (timeout, connection lost)

use std::process;

use taskdeck_sync::config::ConfigError;
use taskdeck_sync::rpc::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Unreachable = 10,
    Rejected = 12,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(request_err) = cause.downcast_ref::<RequestError>() {
                return Self::from_request_error(request_err);
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                return Self::Usage;
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("timed out connecting") {
            return Self::Unreachable;
        }
        Self::Error
    }

    pub fn from_request_error(err: &RequestError) -> Self {
        match err {
            RequestError::NotConnected => Self::Unreachable,
            RequestError::Timeout { .. } | RequestError::ConnectionLost { .. } => Self::Network,
            RequestError::Server(_) => Self::Rejected,
            RequestError::Encode(_) | RequestError::Decode { .. } => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}
