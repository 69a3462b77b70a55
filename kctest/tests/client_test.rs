#![cfg(feature = "integ")]

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kctest::{Cluster, Config, DeferredProbe, Error, HttpStatusCode, ListOptions};
use std::collections::BTreeMap;
use tokio::time::Duration;

async fn cluster(name: &str) -> Cluster {
    let config = Config {
        kind_cluster: false,
        ..Config::default()
    };
    Cluster::provision(name, config).await.unwrap()
}

fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

fn config_map(namespace: &str, name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), "kctest".to_string())])),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([("key".to_string(), name.to_string())])),
        ..ConfigMap::default()
    }
}

/// Invokes `probe` until it succeeds or `attempts` run out.
async fn eventually<P>(probe: &P, attempts: usize) -> kctest::Result<P::Output>
where
    P: DeferredProbe,
{
    let mut result = probe.invoke().await;
    for _ in 1..attempts {
        if result.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        result = probe.invoke().await;
    }
    result
}

#[tokio::test]
async fn create_and_get() {
    let cluster = cluster("client-get").await;
    let cm = config_map("default", "cm1");
    let created = cluster.create(&cm).await.unwrap();
    assert_eq!(created.data, cm.data);

    let stored = eventually(&cluster.get(&cm), 10).await.unwrap();
    assert_eq!(stored.metadata.name.as_deref(), Some("cm1"));
    assert_eq!(stored.data, cm.data);

    // A second create of the same object conflicts.
    let err = cluster.create(&cm).await.unwrap_err();
    assert!(err.is_already_exists(), "{}", err);
    cluster.teardown().unwrap();
}

#[tokio::test]
async fn missing_namespace_uses_default() {
    let cluster = cluster("client-default-ns").await;
    let mut cm = config_map("default", "no-namespace");
    cm.metadata.namespace = None;
    cluster.create(&cm).await.unwrap();
    let stored = cluster.get(&cm).invoke().await.unwrap();
    assert_eq!(stored.metadata.namespace.as_deref(), Some("default"));
    cluster.teardown().unwrap();
}

#[tokio::test]
async fn nameless_object() {
    let cluster = cluster("client-nameless").await;
    let mut cm = config_map("default", "unused");
    cm.metadata.name = None;
    let err = cluster.create(&cm).await.unwrap_err();
    assert!(matches!(err, Error::Store { .. }), "{}", err);
    let err = cluster.get(&cm).invoke().await.unwrap_err();
    assert!(matches!(err, Error::MissingName { .. }), "{}", err);
    cluster.teardown().unwrap();
}

#[tokio::test]
async fn get_absent_object() {
    let cluster = cluster("client-absent").await;
    let err = cluster
        .get(&config_map("default", "never-created"))
        .invoke()
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{}", err);
    cluster.teardown().unwrap();
}

#[tokio::test]
async fn list_in_namespace() {
    let cluster = cluster("client-list").await;
    cluster.create(&namespace("populated")).await.unwrap();
    cluster.create(&namespace("empty")).await.unwrap();
    for i in 0..3 {
        cluster
            .create(&config_map("populated", &format!("cm{}", i)))
            .await
            .unwrap();
    }

    let probe =
        cluster.list::<ConfigMap>(ListOptions::in_namespace("populated").labels("app=kctest"));
    let mut items = Vec::new();
    probe.invoke_into(&mut items).await.unwrap();
    assert_eq!(items.len(), 3);

    let items = cluster
        .list::<ConfigMap>(ListOptions::in_namespace("empty"))
        .invoke()
        .await
        .unwrap();
    assert!(items.is_empty());

    let namespaces = cluster
        .list::<Namespace>(ListOptions::default().fields("metadata.name=populated"))
        .invoke()
        .await
        .unwrap();
    assert_eq!(namespaces.len(), 1);
    cluster.teardown().unwrap();
}

#[tokio::test]
async fn delete() {
    let cluster = cluster("client-delete").await;
    let cm = config_map("default", "doomed");

    let err = cluster.delete(&cm).invoke().await.unwrap_err();
    assert!(err.is_not_found(), "{}", err);

    cluster.create(&cm).await.unwrap();
    let probe = cluster.delete(&cm);
    probe.invoke().await.unwrap();
    let err = cluster.get(&cm).invoke().await.unwrap_err();
    assert!(err.is_not_found(), "{}", err);

    // The same probe fails once the object is gone.
    let err = probe.invoke().await.unwrap_err();
    assert!(err.is_not_found(), "{}", err);
    cluster.teardown().unwrap();
}
