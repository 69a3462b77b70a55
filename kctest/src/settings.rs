use log::warn;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// The control-plane version whose binaries the emulator expects to find in the binary-assets
/// directory.
pub const CONTROL_PLANE_VERSION: &str = "1.30.0";

/// `Settings` provides a way to pass arguments into the harness using environment variables. All
/// variables are prefixed with `KCTEST_`.
pub struct Settings {}

impl Settings {
    /// The path or name of the `kind` binary.
    pub fn kind_path() -> &'static str {
        SETTINGS.kind_path.as_str()
    }

    /// The path or name of the container runtime binary used to check that containers can be run.
    pub fn container_runtime_path() -> &'static str {
        SETTINGS.container_runtime_path.as_str()
    }

    /// The directory holding the `etcd` and `kube-apiserver` binaries.
    pub fn binary_assets_dir() -> PathBuf {
        SETTINGS
            .binary_assets_dir
            .clone()
            .unwrap_or_else(default_binary_assets_dir)
    }

    /// How long to wait for the control plane to become ready.
    pub fn start_timeout() -> Duration {
        Duration::from_secs(SETTINGS.start_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
struct Inner {
    /// The path to the [kind] binary. Defaults to `kind` (i.e. by default the kind binary is
    /// expected to be found via `$PATH`).
    ///
    /// # Example
    ///
    /// ```text
    /// KCTEST_KIND_PATH=/wherever/kind
    /// ```
    ///
    /// [kind]: https://kind.sigs.k8s.io/
    #[serde(default = "kind")]
    kind_path: String,

    /// The path to the container runtime binary. Defaults to `docker`.
    #[serde(default = "docker")]
    container_runtime_path: String,

    /// Overrides the binary-assets directory, e.g. `KCTEST_BINARY_ASSETS_DIR=/usr/local/kubebuilder/bin`.
    #[serde(default)]
    binary_assets_dir: Option<PathBuf>,

    #[serde(default = "start_timeout_secs")]
    start_timeout_secs: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            kind_path: kind(),
            container_runtime_path: docker(),
            binary_assets_dir: None,
            start_timeout_secs: start_timeout_secs(),
        }
    }
}

lazy_static::lazy_static! {
    static ref SETTINGS: Inner = match envy::prefixed("KCTEST_").from_env::<Inner>() {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Unable to parse KCTEST_ environment variables, using defaults: {}", e);
            Inner::default()
        }
    };
}

/// We need these to provide defaults for serde.
fn kind() -> String {
    String::from("kind")
}

fn docker() -> String {
    String::from("docker")
}

fn start_timeout_secs() -> u64 {
    60
}

/// `bin/k8s/<version>-<os>-<arch>`, with the platform spelled the way the published control-plane
/// binary archives spell it.
pub(crate) fn default_binary_assets_dir() -> PathBuf {
    PathBuf::from("bin").join("k8s").join(format!(
        "{}-{}-{}",
        CONTROL_PLANE_VERSION,
        go_os(std::env::consts::OS),
        go_arch(std::env::consts::ARCH)
    ))
}

fn go_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn go_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
        "powerpc64" => "ppc64",
        other => other,
    }
}
