use std::path::PathBuf;

/// The directory holding the CRD manifests used by the integration tests.
pub fn crd_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join("crds")
}
