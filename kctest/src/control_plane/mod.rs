/*!

A local control-plane emulator: an `etcd` and a `kube-apiserver` run from a binary-assets
directory, each listening on an ephemeral loopback port and keeping its state in a private
temporary directory. The binaries themselves are black boxes; this module only launches them,
waits for the API server to answer, installs any `CustomResourceDefinition`s and shuts everything
down again.

!*/

mod error;
mod pki;

pub use error::{Error, Result};

use crate::settings::Settings;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use log::{debug, info, warn};
use pki::Credentials;
use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt};
use std::fs::File;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

pub const KUBECONFIG_FILENAME: &str = "kubeconfig.yaml";

const ETCD: &str = "etcd";
const KUBE_APISERVER: &str = "kube-apiserver";
const HOST: &str = "127.0.0.1";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Options for launching a [`ControlPlane`].
#[derive(Debug, Clone)]
pub struct ControlPlaneSettings {
    /// The directory holding the `etcd` and `kube-apiserver` binaries.
    pub binary_assets_dir: PathBuf,
    /// Files, or directories of `.yaml`/`.yml`/`.json` files, containing
    /// `CustomResourceDefinition`s to install once the API server is up.
    pub crd_paths: Vec<PathBuf>,
    /// Fail instead of skipping when one of the `crd_paths` does not exist.
    pub error_if_crd_path_missing: bool,
    /// How long to wait for the API server and the CRDs to become ready.
    pub start_timeout: Duration,
    /// How long to wait for each process to exit once it has been killed.
    pub stop_timeout: Duration,
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self {
            binary_assets_dir: Settings::binary_assets_dir(),
            crd_paths: Vec::new(),
            error_if_crd_path_missing: true,
            start_timeout: Settings::start_timeout(),
            stop_timeout: Duration::from_secs(20),
        }
    }
}

/// A running `etcd` and `kube-apiserver` pair. Any process still running when the `ControlPlane`
/// is dropped is killed.
#[derive(Debug)]
pub struct ControlPlane {
    name: String,
    dir: TempDir,
    endpoint: String,
    etcd: Option<Child>,
    api_server: Option<Child>,
    stop_timeout: Duration,
}

impl ControlPlane {
    /// Start a control plane identified by `name` and wait until it serves requests. If startup
    /// fails, the processes already started are stopped before the error is returned.
    pub async fn start(name: &str, settings: &ControlPlaneSettings) -> Result<Self> {
        let crd_files = crd_files(&settings.crd_paths, settings.error_if_crd_path_missing)?;
        let etcd_path = binary(&settings.binary_assets_dir, ETCD)?;
        let api_server_path = binary(&settings.binary_assets_dir, KUBE_APISERVER)?;
        let dir = TempDir::new().context(error::IoSnafu {
            action: "create control-plane directory",
        })?;
        let [etcd_port, peer_port, api_port] = free_ports()?;

        let mut control_plane = Self {
            name: name.to_string(),
            dir,
            endpoint: format!("https://{}:{}", HOST, api_port),
            etcd: None,
            api_server: None,
            stop_timeout: settings.stop_timeout,
        };
        info!(
            "Starting control plane '{}' at {}",
            name, control_plane.endpoint
        );
        let started = control_plane
            .bring_up(
                &etcd_path,
                &api_server_path,
                (etcd_port, peer_port, api_port),
                &crd_files,
                settings.start_timeout,
            )
            .await;
        if let Err(e) = started {
            if let Err(stop_error) = control_plane.stop() {
                warn!(
                    "Unable to clean up control plane '{}' after failed start: {}",
                    name, stop_error
                );
            }
            return Err(e);
        }
        Ok(control_plane)
    }

    async fn bring_up(
        &mut self,
        etcd_path: &Path,
        api_server_path: &Path,
        (etcd_port, peer_port, api_port): (u16, u16, u16),
        crd_files: &[PathBuf],
        timeout: Duration,
    ) -> Result<()> {
        let credentials = Credentials::generate(&[HOST, "localhost"])?;
        let certs = self.dir.path().join("certs");
        std::fs::create_dir_all(&certs).context(error::IoSnafu {
            action: "create certificate directory",
        })?;
        write(&certs.join("ca.crt"), &credentials.ca_cert_pem)?;
        write(&certs.join("apiserver.crt"), &credentials.serving_cert_pem)?;
        write(&certs.join("apiserver.key"), &credentials.serving_key_pem)?;
        write(
            &certs.join("service-account.key"),
            &credentials.service_account_key_pem,
        )?;
        write(&certs.join("token.csv"), &credentials.token_file())?;

        let etcd_url = format!("http://{}:{}", HOST, etcd_port);
        let etcd_args = vec![
            format!("--data-dir={}", self.dir.path().join("etcd").display()),
            format!("--listen-client-urls={}", etcd_url),
            format!("--advertise-client-urls={}", etcd_url),
            format!("--listen-peer-urls=http://{}:{}", HOST, peer_port),
            "--unsafe-no-fsync=true".to_string(),
        ];
        self.etcd = Some(self.spawn(ETCD, etcd_path, &etcd_args)?);

        let api_server_args = vec![
            format!("--advertise-address={}", HOST),
            format!("--bind-address={}", HOST),
            format!("--secure-port={}", api_port),
            format!("--etcd-servers={}", etcd_url),
            format!("--cert-dir={}", certs.display()),
            format!("--tls-cert-file={}", certs.join("apiserver.crt").display()),
            format!(
                "--tls-private-key-file={}",
                certs.join("apiserver.key").display()
            ),
            format!("--token-auth-file={}", certs.join("token.csv").display()),
            format!(
                "--service-account-key-file={}",
                certs.join("service-account.key").display()
            ),
            format!(
                "--service-account-signing-key-file={}",
                certs.join("service-account.key").display()
            ),
            format!("--service-account-issuer={}", self.endpoint),
            "--service-cluster-ip-range=10.0.0.0/24".to_string(),
            "--authorization-mode=RBAC".to_string(),
            "--allow-privileged=true".to_string(),
            "--disable-admission-plugins=ServiceAccount".to_string(),
        ];
        self.api_server = Some(self.spawn(KUBE_APISERVER, api_server_path, &api_server_args)?);

        write(
            &self.kubeconfig(),
            &kubeconfig(
                &self.endpoint,
                &base64::encode(&credentials.ca_cert_pem),
                &credentials.token,
            ),
        )?;

        let deadline = Instant::now() + timeout;
        let client = self.client().await?;
        self.wait_until_ready(&client, deadline, timeout).await?;
        debug!("Control plane '{}' is ready", self.name);
        install_crds(&client, crd_files, deadline, timeout).await
    }

    fn spawn(&self, binary: &str, path: &Path, args: &[String]) -> Result<Child> {
        let log = self.log_path(binary);
        let stdout = File::create(&log).context(error::IoSnafu {
            action: format!("create '{}'", log.display()),
        })?;
        let stderr = stdout.try_clone().context(error::IoSnafu {
            action: format!("open '{}'", log.display()),
        })?;
        debug!("Running '{} {}'", path.display(), args.join(" "));
        Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .context(error::SpawnSnafu { binary })
    }

    async fn wait_until_ready(
        &mut self,
        client: &Client,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        loop {
            self.ensure_running()?;
            let request = http::Request::get("/readyz")
                .body(Vec::new())
                .context(error::RequestSnafu)?;
            let last_error = match client.request_text(request).await {
                Ok(_) => return Ok(()),
                Err(e) => e.to_string(),
            };
            ensure!(
                Instant::now() < deadline,
                error::NotReadySnafu {
                    timeout,
                    last_error,
                }
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Fails if either process has already exited.
    fn ensure_running(&mut self) -> Result<()> {
        for (binary, child) in [(ETCD, &mut self.etcd), (KUBE_APISERVER, &mut self.api_server)] {
            if let Some(child) = child {
                let status = child.try_wait().context(error::IoSnafu {
                    action: format!("check on '{}'", binary),
                })?;
                if let Some(status) = status {
                    return error::ProcessExitedSnafu {
                        binary,
                        status,
                        log: self.dir.path().join(format!("{}.log", binary)),
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    /// A control plane with no processes behind it.
    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: TempDir::new().unwrap(),
            endpoint: format!("https://{}:0", HOST),
            etcd: None,
            api_server: None,
            stop_timeout: Duration::from_secs(1),
        }
    }

    /// Takes `child` as the API server process.
    #[cfg(test)]
    pub(crate) fn with_api_server(mut self, child: Child, stop_timeout: Duration) -> Self {
        self.api_server = Some(child);
        self.stop_timeout = stop_timeout;
        self
    }

    /// The name the control plane was started with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The URL of the API server.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the path to the kubeconfig file for the API server.
    pub fn kubeconfig(&self) -> PathBuf {
        self.dir.path().join(KUBECONFIG_FILENAME)
    }

    /// Returns the path to the combined stdout/stderr log of `binary`.
    pub fn log_path(&self, binary: &str) -> PathBuf {
        self.dir.path().join(format!("{}.log", binary))
    }

    /// Returns `true` while either process is still running.
    pub fn is_running(&mut self) -> bool {
        [&mut self.etcd, &mut self.api_server]
            .into_iter()
            .flatten()
            .any(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// The connection configuration for the API server.
    pub async fn config(&self) -> Result<Config> {
        let kubeconfig =
            Kubeconfig::read_from(self.kubeconfig()).context(error::KubeconfigReadSnafu)?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context(error::ClientConfigSnafu)
    }

    /// Create a k8s client for the API server.
    pub async fn client(&self) -> Result<Client> {
        Client::try_from(self.config().await?).context(error::ClientSnafu)
    }

    /// Stop the API server, then etcd. Both are attempted; the first failure is returned.
    pub fn stop(&mut self) -> Result<()> {
        info!("Stopping control plane '{}'", self.name);
        let api_server = terminate(KUBE_APISERVER, self.api_server.take(), self.stop_timeout);
        let etcd = terminate(ETCD, self.etcd.take(), self.stop_timeout);
        api_server.and(etcd)
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        if self.etcd.is_some() || self.api_server.is_some() {
            if let Err(e) = self.stop() {
                warn!("Unable to stop control plane '{}': {}", self.name, e)
            }
        }
    }
}

fn terminate(binary: &str, child: Option<Child>, timeout: Duration) -> Result<()> {
    let mut child = match child {
        Some(child) => child,
        None => return Ok(()),
    };
    let exited = child.try_wait().context(error::StopSnafu { binary })?;
    if exited.is_none() {
        child.kill().context(error::StopSnafu { binary })?;
    }
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if child
            .try_wait()
            .context(error::StopSnafu { binary })?
            .is_some()
        {
            return Ok(());
        }
        ensure!(
            std::time::Instant::now() < deadline,
            error::StopTimeoutSnafu { binary, timeout }
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn binary(assets_dir: &Path, binary: &str) -> Result<PathBuf> {
    let path = assets_dir.join(binary);
    ensure!(
        path.is_file(),
        error::BinaryMissingSnafu { binary, assets_dir }
    );
    Ok(path)
}

/// Reserves three distinct loopback ports by binding them all at once and releasing them.
fn free_ports() -> Result<[u16; 3]> {
    let listeners = (0..3)
        .map(|_| TcpListener::bind((HOST, 0)))
        .collect::<std::io::Result<Vec<_>>>()
        .context(error::IoSnafu {
            action: "reserve a port",
        })?;
    let mut ports = [0; 3];
    for (port, listener) in ports.iter_mut().zip(&listeners) {
        *port = listener
            .local_addr()
            .context(error::IoSnafu {
                action: "read a reserved port",
            })?
            .port();
    }
    Ok(ports)
}

fn write(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).context(error::IoSnafu {
        action: format!("write '{}'", path.display()),
    })
}

fn kubeconfig(endpoint: &str, ca_data: &str, token: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: Config
clusters:
- name: kctest
  cluster:
    server: {endpoint}
    certificate-authority-data: {ca_data}
users:
- name: kctest-admin
  user:
    token: {token}
contexts:
- name: kctest
  context:
    cluster: kctest
    user: kctest-admin
    namespace: default
current-context: kctest
"#
    )
}

/// Expands `paths` into the manifest files to install. Directories contribute their `.yaml`,
/// `.yml` and `.json` files in name order.
pub(crate) fn crd_files(paths: &[PathBuf], error_if_missing: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if !path.exists() {
            ensure!(!error_if_missing, error::CrdPathMissingSnafu { path });
            warn!("Skipping missing CRD path '{}'", path.display());
            continue;
        }
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        let mut entries = std::fs::read_dir(path)
            .context(error::IoSnafu {
                action: format!("read '{}'", path.display()),
            })?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .context(error::IoSnafu {
                action: format!("read '{}'", path.display()),
            })?;
        entries.retain(|entry| {
            entry.is_file()
                && matches!(
                    entry.extension().and_then(|ext| ext.to_str()),
                    Some("yaml" | "yml" | "json")
                )
        });
        entries.sort();
        files.extend(entries);
    }
    Ok(files)
}

/// Reads every `CustomResourceDefinition` document in `path`.
pub(crate) fn read_crds(path: &Path) -> Result<Vec<CustomResourceDefinition>> {
    let manifest = std::fs::read_to_string(path).context(error::IoSnafu {
        action: format!("read '{}'", path.display()),
    })?;
    let mut crds = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&manifest) {
        let value = serde_yaml::Value::deserialize(doc).context(error::CrdParseSnafu { path })?;
        if value.is_null() {
            continue;
        }
        let crd: CustomResourceDefinition =
            serde_yaml::from_value(value).context(error::CrdParseSnafu { path })?;
        ensure!(crd.metadata.name.is_some(), error::CrdNameSnafu { path });
        crds.push(crd);
    }
    Ok(crds)
}

async fn install_crds(
    client: &Client,
    files: &[PathBuf],
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let mut names = Vec::new();
    for file in files {
        for crd in read_crds(file)? {
            let name = crd.metadata.name.clone().context(error::CrdNameSnafu {
                path: file.as_path(),
            })?;
            debug!("Installing CustomResourceDefinition '{}'", name);
            api.create(&PostParams::default(), &crd)
                .await
                .context(error::CrdCreateSnafu { name: &name })?;
            names.push(name);
        }
    }
    for name in names {
        while !is_established(&api, &name).await {
            ensure!(
                Instant::now() < deadline,
                error::CrdNotEstablishedSnafu { name, timeout }
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    Ok(())
}

async fn is_established(api: &Api<CustomResourceDefinition>, name: &str) -> bool {
    api.get(name)
        .await
        .ok()
        .and_then(|crd| crd.status)
        .and_then(|status| status.conditions)
        .unwrap_or_default()
        .iter()
        .any(|condition| condition.type_ == "Established" && condition.status == "True")
}
