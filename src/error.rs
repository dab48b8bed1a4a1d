//! Error taxonomy for the layout engine
//!
//! Every error is `Clone` so a single-flight construction can replay the same
//! failure to every subscriber.

use std::fmt;
use thiserror::Error;

/// Device operation kind that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    /// Kernel compilation
    Compile,
    /// Kernel execution
    Execute,
    /// Buffer allocation
    Allocate,
    /// Device → host transfer
    Read,
    /// Host → device transfer
    Write,
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Compile => "compile",
            Self::Execute => "exec",
            Self::Allocate => "allocate",
            Self::Read => "read",
            Self::Write => "write",
        };
        f.write_str(s)
    }
}

/// A device operation (compile, exec, buffer op) failed
///
/// `name` is the kernel name for compile/exec and the buffer tag for buffer
/// operations. `site` is the caller's source location.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{op} `{name}` failed at {site}: {reason}")]
pub struct DeviceOperationFailure {
    /// Operation kind
    pub op: DeviceOp,
    /// Kernel name or buffer tag
    pub name: String,
    /// Call site (`file:line:column`)
    pub site: String,
    /// Backend-provided reason
    pub reason: String,
}

impl DeviceOperationFailure {
    /// Build a failure tagged with the caller's location
    #[track_caller]
    pub fn new(op: DeviceOp, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::at(op, name, reason, std::panic::Location::caller())
    }

    /// Build a failure tagged with an explicit location
    pub fn at(
        op: DeviceOp,
        name: impl Into<String>,
        reason: impl Into<String>,
        site: &std::panic::Location<'_>,
    ) -> Self {
        Self {
            op,
            name: name.into(),
            site: site.to_string(),
            reason: reason.into(),
        }
    }
}

/// Engine-level errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LayoutError {
    /// Kernel compile/exec or buffer operation failed
    #[error(transparent)]
    Device(#[from] DeviceOperationFailure),

    /// Dataset fetch, cache lookup or unpack failed
    #[error("Failed to resolve dataset `{dataset}`: {reason}")]
    DatasetResolution {
        /// Dataset url or key
        dataset: String,
        /// Cause
        reason: String,
    },

    /// Unknown algorithm, parameter, kernel argument, shape or backend
    #[error("Unrecognized {kind}: `{name}`")]
    UnrecognizedConfiguration {
        /// What was being looked up
        kind: &'static str,
        /// The offending name
        name: String,
    },

    /// Selection orchestration failed (wraps the kernel-level failure)
    #[error("{shape} selection failed")]
    Selection {
        /// Shape name (`rectangle` or `circle`)
        shape: &'static str,
        /// Underlying device failure
        #[source]
        source: DeviceOperationFailure,
    },

    /// Engine used out of order (e.g. finalizing twice, buffer not loaded)
    #[error("Invalid engine state: {0}")]
    InvalidState(String),
}

impl LayoutError {
    /// Shorthand for [`LayoutError::UnrecognizedConfiguration`]
    pub fn unrecognized(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnrecognizedConfiguration {
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for [`LayoutError::DatasetResolution`]
    pub fn dataset(dataset: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::DatasetResolution {
            dataset: dataset.into(),
            reason: reason.to_string(),
        }
    }

    /// The device failure behind this error, at either level
    #[must_use]
    pub fn device_failure(&self) -> Option<&DeviceOperationFailure> {
        match self {
            Self::Device(failure) | Self::Selection { source: failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Result alias for engine operations
pub type Result<T, E = LayoutError> = std::result::Result<T, E>;
