use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("endpoint creation failed: {0}")]
    Endpoint(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether the error is scoped to a single flow. Setup and config
    /// errors are the only ones that should ever stop the process.
    pub fn is_flow_local(&self) -> bool {
        !self.kind().is_fatal()
    }

    /// Try to extract a GatewayError from an anyhow::Error, or classify
    /// the underlying error heuristically (e.g. io::Error kinds).
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        if let Some(ge) = err.downcast_ref::<GatewayError>() {
            return ge.kind();
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return ErrorKind::from_io(io_err);
        }
        ErrorKind::Other
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Io(e) => ErrorKind::from_io(e),
            GatewayError::Config(_) => ErrorKind::Config,
            GatewayError::Setup(_) => ErrorKind::Setup,
            GatewayError::Endpoint(_) => ErrorKind::Endpoint,
            GatewayError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            GatewayError::ConnectionReset(_) => ErrorKind::ConnectionReset,
            GatewayError::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            GatewayError::Unreachable(_) => ErrorKind::Unreachable,
            GatewayError::Unsupported(_) => ErrorKind::Unsupported,
            GatewayError::Other(e) => GatewayError::classify(e),
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Config,
    Setup,
    Endpoint,
    ConnectionRefused,
    ConnectionReset,
    ConnectionTimeout,
    Unreachable,
    Unsupported,
    Other,
}

impl ErrorKind {
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as K;
        match err.kind() {
            K::ConnectionRefused => ErrorKind::ConnectionRefused,
            K::ConnectionReset | K::ConnectionAborted | K::BrokenPipe => {
                ErrorKind::ConnectionReset
            }
            K::TimedOut => ErrorKind::ConnectionTimeout,
            K::AddrNotAvailable => ErrorKind::Unreachable,
            _ => match err.raw_os_error() {
                #[cfg(unix)]
                Some(code) if is_unreachable_errno(code) => ErrorKind::Unreachable,
                _ => ErrorKind::Io,
            },
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Config | ErrorKind::Setup)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Io => "IO",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Setup => "SETUP",
            ErrorKind::Endpoint => "ENDPOINT",
            ErrorKind::ConnectionRefused => "CONN_REFUSED",
            ErrorKind::ConnectionReset => "CONN_RESET",
            ErrorKind::ConnectionTimeout => "CONN_TIMEOUT",
            ErrorKind::Unreachable => "UNREACHABLE",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::Other => "OTHER",
        }
    }
}

#[cfg(unix)]
fn is_unreachable_errno(code: i32) -> bool {
    // ENETUNREACH / EHOSTUNREACH
    #[cfg(target_os = "linux")]
    {
        code == libc::ENETUNREACH || code == libc::EHOSTUNREACH
    }
    #[cfg(not(target_os = "linux"))]
    {
        code == 51 || code == 65
    }
}

impl From<GatewayError> for std::io::Error {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Io(inner) => inner,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
