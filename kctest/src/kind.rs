/*!

The process driver for containerized clusters. `kind` is treated as a black box with three
subcommands, and every failure is normalized into one of the crate's error variants with the
tool's combined output attached verbatim.

!*/

use crate::error::{self, Result};
use crate::settings::Settings;
use log::debug;
use snafu::ensure;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// The capability the lifecycle orchestrator needs from a containerized-cluster tool. It is a
/// trait so that tests can substitute a fake for the real `kind` binary.
pub trait ClusterProvider: Send + Sync {
    /// Create a containerized cluster named `name`.
    fn create(&self, name: &str) -> Result<()>;

    /// The names of all containerized clusters that currently exist.
    fn list(&self) -> Result<BTreeSet<String>>;

    /// Delete the containerized cluster named `name`. Deleting a cluster that does not exist is an
    /// error, not a no-op.
    fn delete(&self, name: &str) -> Result<()>;
}

/// Drives the `kind` command line tool.
#[derive(Debug, Clone)]
pub struct KindProvider {
    kind_path: String,
    runtime_path: String,
    kubeconfig: Option<PathBuf>,
}

impl Default for KindProvider {
    fn default() -> Self {
        Self::new(Settings::kind_path(), Settings::container_runtime_path())
    }
}

impl KindProvider {
    /// Create a `KindProvider` that runs `kind_path` for cluster operations and `runtime_path` for
    /// the container runtime availability check.
    pub fn new<S1, S2>(kind_path: S1, runtime_path: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            kind_path: kind_path.into(),
            runtime_path: runtime_path.into(),
            kubeconfig: None,
        }
    }

    /// Have `kind` write cluster credentials to `kubeconfig` instead of the default kubeconfig.
    pub fn with_kubeconfig<P>(mut self, kubeconfig: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.kubeconfig = Some(kubeconfig.into());
        self
    }

    /// Returns the kubeconfig path passed to `kind`, if one was set.
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    /// Runs `docker ps --all --quiet` (or the configured runtime's equivalent) to make sure
    /// containers can be listed before asking `kind` to create any.
    pub fn check_container_runtime(&self) -> Result<()> {
        let args: Vec<OsString> = vec!["ps".into(), "--all".into(), "--quiet".into()];
        let output = run(&self.runtime_path, &args).map_err(|e| error::Error::RuntimeUnavailable {
            runtime: self.runtime_path.clone(),
            output: e.to_string(),
        })?;
        ensure!(
            output.status.success(),
            error::RuntimeUnavailableSnafu {
                runtime: &self.runtime_path,
                output: describe(&output),
            }
        );
        Ok(())
    }

    fn create_args(&self, name: &str) -> Vec<OsString> {
        let mut args = self.kubeconfig_args();
        args.extend(["create", "cluster", "--name", name].map(OsString::from));
        args
    }

    fn delete_args(&self, name: &str) -> Vec<OsString> {
        let mut args = self.kubeconfig_args();
        args.extend(["delete", "cluster", "--name", name].map(OsString::from));
        args
    }

    fn kubeconfig_args(&self) -> Vec<OsString> {
        match &self.kubeconfig {
            Some(path) => vec!["--kubeconfig".into(), path.as_os_str().to_owned()],
            None => Vec::new(),
        }
    }
}

impl ClusterProvider for KindProvider {
    fn create(&self, name: &str) -> Result<()> {
        // kind falls back to its default cluster name when given an empty one.
        ensure!(
            !name.is_empty(),
            error::ClusterCreateFailedSnafu {
                name,
                output: "a cluster name must be provided",
            }
        );
        self.check_container_runtime()?;
        let output = run(&self.kind_path, &self.create_args(name)).map_err(|e| {
            error::Error::ClusterCreateFailed {
                name: name.to_string(),
                output: spawn_failure(&self.kind_path, &e),
            }
        })?;
        ensure!(
            output.status.success(),
            error::ClusterCreateFailedSnafu {
                name,
                output: describe(&output),
            }
        );
        Ok(())
    }

    fn list(&self) -> Result<BTreeSet<String>> {
        let args: Vec<OsString> = vec!["get".into(), "clusters".into()];
        let output =
            run(&self.kind_path, &args).map_err(|e| error::Error::ClusterListFailed {
                output: spawn_failure(&self.kind_path, &e),
            })?;
        ensure!(
            output.status.success(),
            error::ClusterListFailedSnafu {
                output: describe(&output),
            }
        );
        Ok(parse_cluster_list(&String::from_utf8_lossy(&output.stdout)))
    }

    fn delete(&self, name: &str) -> Result<()> {
        ensure!(
            self.list()?.contains(name),
            error::ClusterNotFoundSnafu { name }
        );
        let output = run(&self.kind_path, &self.delete_args(name)).map_err(|e| {
            error::Error::ClusterDeleteFailed {
                name: name.to_string(),
                output: spawn_failure(&self.kind_path, &e),
            }
        })?;
        ensure!(
            output.status.success(),
            error::ClusterDeleteFailedSnafu {
                name,
                output: describe(&output),
            }
        );
        Ok(())
    }
}

fn run(program: &str, args: &[OsString]) -> io::Result<Output> {
    debug!("Running '{} {}'", program, display_args(args));
    Command::new(program).args(args).output()
}

fn display_args(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `kind get clusters` prints one name per line. When there are no clusters it says so on stderr,
/// so only stdout is parsed.
pub(crate) fn parse_cluster_list(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// The exit status and combined stdout/stderr of a finished process.
fn describe(output: &Output) -> String {
    format!(
        "exit status '{}'\n\n{}{}",
        output.status.code().unwrap_or(1),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    )
}

fn spawn_failure(program: &str, e: &io::Error) -> String {
    format!("unable to run '{}': {}", program, e)
}
