use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("could not resolve VM \"{identifier}\"")]
    #[diagnostic(help(
        "pass a .vmx path, a nickname under vm_dir, or enable [rest] to search the remote inventory"
    ))]
    Resolution { identifier: String },

    #[error("{backend} {operation} failed: {message}")]
    Transport {
        backend: &'static str,
        operation: String,
        message: String,
        /// Raw stdout/stderr of the driver, or the HTTP body.
        detail: String,
    },

    #[error("guest {vm} was not ready after {attempts} attempts")]
    #[diagnostic(help("raise --tries or --sleep and retry"))]
    ReadinessTimeout { vm: String, attempts: u32 },

    #[error("{operation} requires a remote session")]
    #[diagnostic(help("set [rest] enabled = true in the config"))]
    RemoteSessionRequired { operation: String },

    #[error("{backend} transport does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: String,
    },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("cannot {verb} a VM that is {state}")]
    InvalidTransition { verb: String, state: String },

    #[error("could not find a free clone name for {source_vm} after {attempts} attempts")]
    CloneCollision { source_vm: String, attempts: u32 },

    #[error("guest execution did not finish within {seconds}s")]
    ExecutionTimeout { seconds: u64 },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

