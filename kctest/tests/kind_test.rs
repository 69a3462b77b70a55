#![cfg(feature = "integ")]

use kctest::{ClusterProvider, Error, KindProvider};

#[test]
fn create_list_delete() {
    let provider = KindProvider::default();
    provider.check_container_runtime().unwrap();
    provider.create("kctest-kind").unwrap();
    assert!(provider.list().unwrap().contains("kctest-kind"));
    provider.delete("kctest-kind").unwrap();
    assert!(!provider.list().unwrap().contains("kctest-kind"));
}

#[test]
fn delete_missing_cluster() {
    let provider = KindProvider::default();
    for _ in 0..2 {
        let err = provider.delete("kctest-never-created").unwrap_err();
        assert!(matches!(err, Error::ClusterNotFound { .. }), "{}", err);
    }
}

#[test]
fn invalid_name() {
    let err = KindProvider::default()
        .create("test_cluster")
        .unwrap_err();
    assert!(matches!(err, Error::ClusterCreateFailed { .. }), "{}", err);
}
