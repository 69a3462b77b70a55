use crate::control_plane;
use crate::status::{HttpStatusCode, StatusCode};
use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for `kctest`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Invalid cluster name '{}': a cluster name must be provided", name))]
    InvalidName { name: String },

    #[snafu(display(
        "Container runtime '{}' is not available, verify that it is installed and running: {}",
        runtime,
        output
    ))]
    RuntimeUnavailable { runtime: String, output: String },

    #[snafu(display(
        "Failed to create kind cluster '{}', verify that kind is installed: {}",
        name,
        output
    ))]
    ClusterCreateFailed { name: String, output: String },

    #[snafu(display("Failed to get kind clusters, verify that kind is installed: {}", output))]
    ClusterListFailed { output: String },

    #[snafu(display("Failed to delete kind cluster '{}': {}", name, output))]
    ClusterDeleteFailed { name: String, output: String },

    #[snafu(display("Kind cluster '{}' not found", name))]
    ClusterNotFound { name: String },

    #[snafu(display("Unable to start the control plane for '{}': {}", name, source))]
    EmulatorStartFailed {
        name: String,
        source: control_plane::Error,
    },

    #[snafu(display("Unable to stop the control plane for '{}': {}", name, source))]
    EmulatorStopFailed {
        name: String,
        source: control_plane::Error,
    },

    #[snafu(display("Unable to create a Kubernetes client for '{}': {}", name, source))]
    ClientCreate {
        name: String,
        source: control_plane::Error,
    },

    #[snafu(display("Health check for '{}' failed: {}", name, source))]
    Health { name: String, source: kube::Error },

    #[snafu(display("Unable to build request: {}", source))]
    Request { source: http::Error },

    #[snafu(display("Unable to {} {}: {}", method, what, source))]
    Store {
        /// What we were trying to do, e.g. 'get'.
        method: String,
        /// The kind and identity of the object, e.g. `ConfigMap 'default/cm1'`.
        what: String,
        /// The error from kube-rs.
        source: kube::Error,
    },

    #[snafu(display("Unable to {} {}: the object has no name", method, what))]
    MissingName { method: String, what: String },
}

impl HttpStatusCode for Error {
    fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::Store { source, .. } | Error::Health { source, .. } => source.status_code(),
            _ => None,
        }
    }
}
