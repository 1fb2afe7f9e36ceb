use std::fmt;
use std::io;

use linkrpc_frame::FrameError;
use linkrpc_node::NodeError;
use linkrpc_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Transport(source) => transport_error(context, source),
        FrameError::PayloadTooLarge { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other if other.is_malformed() => CliError::new(DATA_INVALID, format!("{context}: {other}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn node_error(context: &str, err: NodeError) -> CliError {
    match err {
        NodeError::Transport(err) => transport_error(context, err),
        NodeError::Frame(err) => frame_error(context, err),
        NodeError::Io(err) => io_error(context, err),
        NodeError::Packet(_) | NodeError::MalformedReply(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        NodeError::Config(_)
        | NodeError::InvalidFunction(_)
        | NodeError::DuplicateFunction { .. }
        | NodeError::FunctionNameTooLong { .. }
        | NodeError::ReservedFunctionId(_) => CliError::new(USAGE, format!("{context}: {err}")),
        NodeError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        NodeError::SendFailed { .. } => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        NodeError::HandshakeFailed(_) | NodeError::CallFailed(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn node_errors_map_to_exit_codes() {
        assert_eq!(node_error("x", NodeError::Timeout(Duration::from_secs(1))).code, TIMEOUT);
        assert_eq!(node_error("x", NodeError::InvalidFunction("f".into())).code, USAGE);
        assert_eq!(
            node_error("x", NodeError::Transport(TransportError::Closed)).code,
            TRANSPORT_ERROR
        );
        assert_eq!(node_error("x", NodeError::UnknownPeer(3)).code, INTERNAL);
    }

    #[test]
    fn malformed_frames_are_data_errors() {
        assert_eq!(frame_error("x", FrameError::MissingMarker).code, DATA_INVALID);
        assert_eq!(
            frame_error("x", FrameError::PayloadTooLarge { size: 2, max: 1 }).code,
            USAGE
        );
    }

    #[test]
    fn message_carries_context() {
        let err = io_error("reading config", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("reading config: "));
        assert_eq!(err.code, USAGE);
    }
}
