use snafu::Snafu;
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for the control-plane emulator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    #[snafu(display(
        "Control-plane binary '{}' not found in '{}'",
        binary,
        assets_dir.display()
    ))]
    BinaryMissing { binary: String, assets_dir: PathBuf },

    #[snafu(display("Unable to generate {}: {}", what, source))]
    Certificate { what: String, source: rcgen::Error },

    #[snafu(display("Unable to create client: {}", source))]
    Client { source: kube::Error },

    #[snafu(display("Unable to create client from kubeconfig: {}", source))]
    ClientConfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Unable to create CustomResourceDefinition '{}': {}", name, source))]
    CrdCreate { name: String, source: kube::Error },

    #[snafu(display("CustomResourceDefinition in '{}' has no name", path.display()))]
    CrdName { path: PathBuf },

    #[snafu(display(
        "CustomResourceDefinition '{}' was not established within {:?}",
        name,
        timeout
    ))]
    CrdNotEstablished { name: String, timeout: Duration },

    #[snafu(display("Unable to parse CustomResourceDefinitions in '{}': {}", path.display(), source))]
    CrdParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("CustomResourceDefinition path '{}' does not exist", path.display()))]
    CrdPathMissing { path: PathBuf },

    #[snafu(display("Unable to {}: {}", action, source))]
    Io {
        action: String,
        source: std::io::Error,
    },

    #[snafu(display("Unable to read kubeconfig: {}", source))]
    KubeconfigRead {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display(
        "Control plane did not become ready within {:?}, last error: {}",
        timeout,
        last_error
    ))]
    NotReady {
        timeout: Duration,
        last_error: String,
    },

    #[snafu(display("'{}' exited during startup with {}, see '{}'", binary, status, log.display()))]
    ProcessExited {
        binary: String,
        status: std::process::ExitStatus,
        log: PathBuf,
    },

    #[snafu(display("Unable to build request: {}", source))]
    Request { source: http::Error },

    #[snafu(display("Unable to start '{}': {}", binary, source))]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[snafu(display("Unable to stop '{}': {}", binary, source))]
    Stop {
        binary: String,
        source: std::io::Error,
    },

    #[snafu(display("'{}' did not exit within {:?}", binary, timeout))]
    StopTimeout { binary: String, timeout: Duration },
}
