use thiserror::Error;

use crate::classfile::{ReadError, WriteError};

/// Everything that can go wrong while building or running a patch script.
///
/// Configuration problems surface eagerly from the builders; per-class
/// failures are caught by the [`ScriptManager`](crate::ScriptManager) and
/// reported on standard error instead of escaping the class-loading thread.
#[derive(Debug, Error)]
pub enum Error {
    /// A string did not parse as a JVM type or method descriptor.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// A script builder rejected the supplied combination of options.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A hook class could not be read when transplant or insert was asked for.
    #[error("hook class unresolvable: {0}")]
    UnresolvableHook(String),

    /// A script blew up on a particular class.
    #[error("script {script} failed on {class_name}: {message}")]
    TransformFailure {
        script: String,
        class_name: String,
        message: String,
    },

    /// The host runtime cannot re-transform an already loaded class.
    #[error("cannot reload {0}: the host runtime does not support re-transformation")]
    ReloadUnsupported(String),

    #[error(transparent)]
    ClassRead(#[from] ReadError),

    #[error(transparent)]
    ClassWrite(#[from] WriteError),
}
