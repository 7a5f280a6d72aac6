//! Crate-wide error type.

use crate::node::NodeId;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Every way a pipeline can fail, from graph assembly through execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("graph is invalid: {0}")]
    GraphInvalid(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("property type mismatch for '{property}': expected {expected}, got '{value}'")]
    PropertyTypeMismatch {
        property: String,
        expected: &'static str,
        value: String,
    },

    #[error("device allocation failed: {0}")]
    DeviceAllocation(String),

    #[error("device transfer failed: {0}")]
    DeviceTransfer(String),

    #[error("kernel build failed: {0}")]
    KernelBuild(String),

    #[error("kernel launch failed: {0}")]
    KernelLaunch(String),

    #[error("filter '{node}' failed to process: {source}")]
    FilterProcess {
        node: NodeId,
        #[source]
        source: Box<Error>,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("channel disconnected")]
    ChannelDisconnected,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn graph_invalid<S: Into<String>>(msg: S) -> Error {
        Error::GraphInvalid(msg.into())
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(_: crossbeam_channel::SendError<T>) -> Error {
        Error::ChannelDisconnected
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(_: crossbeam_channel::RecvError) -> Error {
        Error::ChannelDisconnected
    }
}

/// A non-fatal warning raised while coercing pipeline-description properties.
///
/// These never reach [`Result`]; the property registry logs them with `warn!`
/// and continues rather than aborting setup.
#[derive(Debug, thiserror::Error)]
pub enum PropertyWarning {
    #[error("unknown property '{0}', ignoring")]
    Unknown(String),
    #[error("property '{name}' expected {expected}, got '{value}'; ignoring")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        value: String,
    },
}
