use crate::client::{DeleteProbe, GetProbe, ListOptions, ListProbe, ObjectClient, ScopedApi};
use crate::control_plane::{ControlPlane, ControlPlaneSettings};
use crate::error::{self, Result};
use crate::kind::{ClusterProvider, KindProvider};
use kube::api::{DeleteParams, PostParams};
use kube::{Client, Resource};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::{ensure, ResultExt};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

/// Options for [`Cluster::provision`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Back the cluster with a `kind` cluster of the same name.
    pub kind_cluster: bool,
    /// Options for the control-plane emulator.
    pub control_plane: ControlPlaneSettings,
}

/// Where a [`Cluster`] is in its life. Provisioning and teardown move forward through these in
/// order; `Failed` is terminal and is reached when provisioning or teardown fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Uninitialized,
    Provisioning,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

/// Represents a test cluster: a running control-plane emulator, clients connected to it and,
/// optionally, a `kind` cluster of the same name. A `Cluster` only exists once everything is up.
///
/// Call [`Cluster::teardown`] when done. If a ready `Cluster` goes out of scope instead, the
/// `Drop` implementation tears it down and logs any failure.
pub struct Cluster {
    name: String,
    kind_cluster: bool,
    state: ClusterState,
    client: ObjectClient,
    k8s_client: Client,
    control_plane: ControlPlane,
    provider: Arc<dyn ClusterProvider>,
}

impl Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("kind_cluster", &self.kind_cluster)
            .field("state", &self.state)
            .field("control_plane", &self.control_plane)
            .finish()
    }
}

impl Cluster {
    /// Provision a cluster named `cluster_name`, using `kind` for the containerized cluster when
    /// `config` asks for one.
    pub async fn provision(cluster_name: &str, config: Config) -> Result<Cluster> {
        Self::provision_with_provider(cluster_name, config, Arc::new(KindProvider::default()))
            .await
    }

    /// Provision a cluster named `cluster_name`, using `provider` for the containerized cluster.
    ///
    /// The containerized cluster is created first. If that fails, no control plane is started. If
    /// a later step fails, the containerized cluster is left in place for the caller to delete.
    pub async fn provision_with_provider(
        cluster_name: &str,
        config: Config,
        provider: Arc<dyn ClusterProvider>,
    ) -> Result<Cluster> {
        crate::init_logging();
        ensure!(
            !cluster_name.is_empty(),
            error::InvalidNameSnafu { name: cluster_name }
        );
        transition(
            cluster_name,
            ClusterState::Uninitialized,
            ClusterState::Provisioning,
        );
        match Self::bring_up(cluster_name, config, provider).await {
            Ok(cluster) => {
                transition(cluster_name, ClusterState::Provisioning, ClusterState::Ready);
                Ok(cluster)
            }
            Err(e) => {
                transition(cluster_name, ClusterState::Provisioning, ClusterState::Failed);
                Err(e)
            }
        }
    }

    async fn bring_up(
        name: &str,
        config: Config,
        provider: Arc<dyn ClusterProvider>,
    ) -> Result<Cluster> {
        if config.kind_cluster {
            info!("Creating kind cluster '{}'", name);
            provider.create(name)?;
        }
        let mut control_plane = ControlPlane::start(name, &config.control_plane)
            .await
            .context(error::EmulatorStartFailedSnafu { name })?;
        let k8s_client = match Self::connect(name, &control_plane).await {
            Ok(k8s_client) => k8s_client,
            Err(e) => {
                if let Err(stop_error) = control_plane.stop() {
                    warn!(
                        "Unable to stop control plane '{}' after failing to connect: {}",
                        name, stop_error
                    );
                }
                return Err(e);
            }
        };
        Ok(Cluster {
            name: name.to_string(),
            kind_cluster: config.kind_cluster,
            state: ClusterState::Ready,
            client: ObjectClient::new(k8s_client.clone()),
            k8s_client,
            control_plane,
            provider,
        })
    }

    /// Builds a client for the control plane and makes sure it can reach the API server.
    async fn connect(name: &str, control_plane: &ControlPlane) -> Result<Client> {
        let k8s_client = control_plane
            .client()
            .await
            .context(error::ClientCreateSnafu { name })?;
        health(name, &k8s_client).await?;
        Ok(k8s_client)
    }

    /// Stop the control plane and then, if this cluster is backed by one, delete the `kind`
    /// cluster. If the control plane cannot be stopped, the `kind` cluster is left alone and the
    /// stop error is returned.
    pub fn teardown(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.set_state(ClusterState::Stopping);
        let stopped = self
            .control_plane
            .stop()
            .context(error::EmulatorStopFailedSnafu {
                name: self.name.as_str(),
            });
        if let Err(e) = stopped {
            self.set_state(ClusterState::Failed);
            return Err(e);
        }
        if self.kind_cluster {
            info!("Deleting kind cluster '{}'", self.name);
            if let Err(e) = self.provider.delete(&self.name) {
                self.set_state(ClusterState::Failed);
                return Err(e);
            }
        }
        self.set_state(ClusterState::Stopped);
        Ok(())
    }

    fn set_state(&mut self, state: ClusterState) {
        transition(&self.name, self.state, state);
        self.state = state;
    }

    /// The logical name of the cluster.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if a `kind` cluster backs this cluster.
    pub fn is_kind_cluster(&self) -> bool {
        self.kind_cluster
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    /// The object-store client for the cluster.
    pub fn client(&self) -> &ObjectClient {
        &self.client
    }

    /// The k8s client for the cluster.
    pub fn k8s_client(&self) -> Client {
        self.k8s_client.clone()
    }

    /// Returns the path to the control plane's kubeconfig file.
    pub fn kubeconfig(&self) -> PathBuf {
        self.control_plane.kubeconfig()
    }

    /// Returns `Ok` if the API server answers its health endpoint.
    pub async fn health(&self) -> Result<()> {
        health(&self.name, &self.k8s_client).await
    }

    /// Create `obj` now. See [`ObjectClient::create`].
    pub async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug,
        K::Scope: ScopedApi,
    {
        self.client.create(obj, &PostParams::default()).await
    }

    /// See [`ObjectClient::get`].
    pub fn get<K>(&self, obj: &K) -> GetProbe<K>
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ScopedApi,
    {
        self.client.get(obj)
    }

    /// See [`ObjectClient::list`].
    pub fn list<K>(&self, options: ListOptions) -> ListProbe<K>
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ScopedApi,
    {
        self.client.list(options)
    }

    /// See [`ObjectClient::delete`].
    pub fn delete<K>(&self, obj: &K) -> DeleteProbe<K>
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ScopedApi,
    {
        self.client.delete(obj, DeleteParams::default())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.state == ClusterState::Ready {
            warn!("Cluster '{}' dropped without teardown", self.name);
            if let Err(e) = self.shutdown() {
                error!("unable to tear down cluster '{}': {}", self.name, e)
            }
        }
    }
}

fn transition(name: &str, from: ClusterState, to: ClusterState) {
    debug!("Cluster '{}': {:?} -> {:?}", name, from, to);
}

async fn health(name: &str, k8s_client: &Client) -> Result<()> {
    let request = http::Request::get("/healthz")
        .body(Vec::new())
        .context(error::RequestSnafu)?;
    k8s_client
        .request_text(request)
        .await
        .context(error::HealthSnafu { name })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// A `ClusterProvider` that keeps clusters in memory and records every call.
    #[derive(Default)]
    struct FakeProvider {
        clusters: Mutex<BTreeSet<String>>,
        calls: Mutex<Vec<String>>,
        fail_create: bool,
    }

    impl FakeProvider {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ClusterProvider for FakeProvider {
        fn create(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("create {}", name));
            ensure!(
                !self.fail_create,
                error::ClusterCreateFailedSnafu {
                    name,
                    output: "ERROR: invalid cluster name",
                }
            );
            self.clusters.lock().unwrap().insert(name.to_string());
            Ok(())
        }

        fn list(&self) -> Result<BTreeSet<String>> {
            self.calls.lock().unwrap().push("list".to_string());
            Ok(self.clusters.lock().unwrap().clone())
        }

        fn delete(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete {}", name));
            ensure!(
                self.clusters.lock().unwrap().remove(name),
                error::ClusterNotFoundSnafu { name }
            );
            Ok(())
        }
    }

    /// Settings that point at a binary-assets directory with nothing in it.
    fn no_binaries(dir: &TempDir) -> ControlPlaneSettings {
        ControlPlaneSettings {
            binary_assets_dir: dir.path().to_path_buf(),
            ..ControlPlaneSettings::default()
        }
    }

    #[tokio::test]
    async fn empty_name() {
        let provider = Arc::new(FakeProvider::default());
        let config = Config {
            kind_cluster: true,
            ..Config::default()
        };
        let err = Cluster::provision_with_provider("", config, provider.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }), "{}", err);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn kind_failure_stops_provisioning() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider {
            fail_create: true,
            ..FakeProvider::default()
        });
        let config = Config {
            kind_cluster: true,
            // Starting the control plane would fail differently, so reaching it shows up in
            // the error variant.
            control_plane: no_binaries(&dir),
        };
        let err = Cluster::provision_with_provider("test_cluster", config, provider.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterCreateFailed { .. }), "{}", err);
        assert_eq!(provider.calls(), vec!["create test_cluster"]);
    }

    #[tokio::test]
    async fn control_plane_failure_after_kind() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let config = Config {
            kind_cluster: true,
            control_plane: no_binaries(&dir),
        };
        let err = Cluster::provision_with_provider("test-cluster", config, provider.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmulatorStartFailed { .. }), "{}", err);
        // The kind cluster is not rolled back.
        assert_eq!(provider.calls(), vec!["create test-cluster"]);
        assert!(provider.list().unwrap().contains("test-cluster"));
    }

    #[tokio::test]
    async fn no_kind_cluster_requested() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let config = Config {
            kind_cluster: false,
            control_plane: no_binaries(&dir),
        };
        let err = Cluster::provision_with_provider("test-cluster", config, provider.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmulatorStartFailed { .. }), "{}", err);
        assert!(provider.calls().is_empty());
    }

    fn ready_cluster(kind_cluster: bool, provider: Arc<FakeProvider>) -> Cluster {
        let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
        let k8s_client = Client::try_from(config).unwrap();
        Cluster {
            name: "test-cluster".to_string(),
            kind_cluster,
            state: ClusterState::Ready,
            client: ObjectClient::new(k8s_client.clone()),
            k8s_client,
            control_plane: ControlPlane::detached("test-cluster"),
            provider,
        }
    }

    fn provider_with(name: &str) -> Arc<FakeProvider> {
        let provider = FakeProvider::default();
        provider.clusters.lock().unwrap().insert(name.to_string());
        Arc::new(provider)
    }

    #[tokio::test]
    async fn teardown_deletes_kind_cluster() {
        let provider = provider_with("test-cluster");
        ready_cluster(true, provider.clone()).teardown().unwrap();
        assert_eq!(provider.calls(), vec!["delete test-cluster"]);
        assert!(provider.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn teardown_without_kind_cluster() {
        let provider = provider_with("test-cluster");
        ready_cluster(false, provider.clone()).teardown().unwrap();
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn teardown_reports_missing_kind_cluster() {
        let provider = Arc::new(FakeProvider::default());
        let err = ready_cluster(true, provider.clone())
            .teardown()
            .unwrap_err();
        assert!(matches!(err, Error::ClusterNotFound { .. }), "{}", err);
    }

    #[tokio::test]
    async fn stop_failure_keeps_kind_cluster() {
        let provider = provider_with("test-cluster");
        let api_server = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let mut cluster = ready_cluster(true, provider.clone());
        cluster.control_plane = ControlPlane::detached("test-cluster")
            .with_api_server(api_server, std::time::Duration::ZERO);
        let err = cluster.teardown().unwrap_err();
        assert!(matches!(err, Error::EmulatorStopFailed { .. }), "{}", err);
        assert!(provider.calls().is_empty());
        assert!(provider.clusters.lock().unwrap().contains("test-cluster"));
    }

    #[tokio::test]
    async fn drop_tears_down_ready_cluster() {
        let provider = provider_with("test-cluster");
        {
            let cluster = ready_cluster(true, provider.clone());
            assert_eq!(cluster.state(), ClusterState::Ready);
            assert!(cluster.is_kind_cluster());
        }
        assert_eq!(provider.calls(), vec!["delete test-cluster"]);
    }

    #[tokio::test]
    async fn health_of_unreachable_endpoint() {
        let cluster = ready_cluster(false, Arc::new(FakeProvider::default()));
        let err = cluster.health().await.unwrap_err();
        assert!(matches!(err, Error::Health { .. }), "{}", err);
        cluster.teardown().unwrap();
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.kind_cluster);
        assert!(config.control_plane.error_if_crd_path_missing);
        assert!(config.control_plane.crd_paths.is_empty());
    }
}
