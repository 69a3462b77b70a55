/*!

Provides disposable Kubernetes clusters for automated tests.

A [`Cluster`] is a local control-plane emulator (`etcd` and `kube-apiserver` started from a
binary-assets directory), optionally accompanied by a `kind` cluster of the same name. Tests create
objects through the cluster eagerly and read, list or delete them through [`DeferredProbe`]s, which
can be invoked repeatedly until the assertion holds.

```no_run
# async fn example() -> kctest::Result<()> {
use k8s_openapi::api::core::v1::ConfigMap;
use kctest::{Cluster, Config, DeferredProbe};

let cluster = Cluster::provision("my-test", Config::default()).await?;
let mut cm = ConfigMap::default();
cm.metadata.name = Some("cm1".to_string());
cm.metadata.namespace = Some("default".to_string());
cluster.create(&cm).await?;
let stored = cluster.get(&cm).invoke().await?;
assert_eq!(stored.metadata.name, cm.metadata.name);
cluster.teardown()
# }
```

!*/

#![deny(
    clippy::expect_used,
    clippy::get_unwrap,
    clippy::panic,
    clippy::panic_in_result_fn,
    clippy::panicking_unwrap,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]

pub mod client;
pub mod cluster;
pub mod control_plane;
mod error;
pub mod kind;
mod settings;
pub mod status;

pub use client::{DeferredProbe, ListOptions, ObjectClient};
pub use cluster::{Cluster, ClusterState, Config};
pub use control_plane::ControlPlaneSettings;
pub use error::{Error, Result};
pub use kind::{ClusterProvider, KindProvider};
pub use settings::{Settings, CONTROL_PLANE_VERSION};
pub use status::HttpStatusCode;

use env_logger::Builder;
use log::LevelFilter;
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Install a test-friendly logger once per process. When `RUST_LOG` is set it decides what is
/// logged; otherwise this crate logs at `info`. A logger installed elsewhere is left in place.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let mut builder = match std::env::var(env_logger::DEFAULT_FILTER_ENV).ok() {
            Some(_) => Builder::from_default_env(),
            None => {
                let mut builder = Builder::new();
                builder.filter(Some(env!("CARGO_CRATE_NAME")), LevelFilter::Info);
                builder
            }
        };
        // An error means some other logger is already installed.
        let _ = builder.is_test(true).try_init();
    });
}
