use thiserror::Error;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<ErrorKind>);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.as_ref()
    }

    pub fn into_kind(self) -> ErrorKind {
        *self.0
    }

    /// A precondition supplied by the caller does not hold. Always raised before
    /// any resource is touched.
    pub fn invalid_arg(name: impl Into<String>, message: impl Into<String>) -> Error {
        Error(
            ErrorKind::InvalidArgument {
                name: name.into(),
                message: message.into(),
            }
            .into(),
        )
    }

    /// The device driver (or the OS primitive standing in for it) reported a failure
    /// during `op`.
    pub fn driver(op: impl Into<String>, message: impl Into<String>) -> Error {
        Error(
            ErrorKind::Driver {
                op: op.into(),
                message: message.into(),
            }
            .into(),
        )
    }

    /// Same as [`Error::driver`], carrying the OS error as the message.
    pub fn driver_os(op: impl Into<String>, source: std::io::Error) -> Error {
        Error::driver(op, source.to_string())
    }

    pub fn not_ready(operation: impl Into<String>, state: impl Into<String>) -> Error {
        Error(
            ErrorKind::NotReady {
                operation: operation.into(),
                state: state.into(),
            }
            .into(),
        )
    }

    pub fn invalid_operation(name: impl Into<String>) -> Error {
        Error(ErrorKind::InvalidOperation { name: name.into() }.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Error {
        Error(
            ErrorKind::Io {
                context: context.into(),
                source,
            }
            .into(),
        )
    }

    pub fn is_invalid_arg(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidArgument { .. })
    }

    pub fn is_driver(&self) -> bool {
        matches!(self.kind(), ErrorKind::Driver { .. })
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotReady { .. })
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("invalid argument {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("driver error in {op}: {message}")]
    Driver { op: String, message: String },

    #[error("{operation} is not valid in state {state}")]
    NotReady { operation: String, state: String },

    #[error("invalid operation {name}")]
    InvalidOperation { name: String },

    #[error("IO error for '{context}': {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(kind.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::io("", e)
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(_: std::convert::Infallible) -> Self {
        Error::invalid_operation("conversion")
    }
}
