use quill_cache::{
    open_cache, BincodeCodec, CacheConfig, CacheError, CacheRegistry, FileId, Fingerprint, ScopeId,
};
use tempfile::TempDir;

fn config(tmp: &TempDir) -> CacheConfig {
    CacheConfig {
        cache_root_override: Some(tmp.path().to_path_buf()),
    }
}

#[test]
fn opening_the_same_cache_twice_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");

    let first = open_cache(
        &registry,
        &config,
        &scope,
        "symbols",
        BincodeCodec::<String>::new(1),
    )
    .unwrap();

    let err = open_cache(
        &registry,
        &config,
        &scope,
        "symbols",
        BincodeCodec::<String>::new(1),
    )
    .unwrap_err();
    assert!(matches!(err, CacheError::AlreadyOpen { name } if name == "symbols"));

    // A different logical name, or the same name in a different scope, is
    // independent.
    open_cache(
        &registry,
        &config,
        &scope,
        "folds",
        BincodeCodec::<String>::new(1),
    )
    .unwrap();
    open_cache(
        &registry,
        &config,
        &ScopeId::from_stable_key("other-project"),
        "symbols",
        BincodeCodec::<String>::new(1),
    )
    .unwrap();

    drop(first);
}

#[test]
fn double_open_applies_to_memory_backends_too() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");

    let _first = open_cache(
        &registry,
        &config,
        &scope,
        "scratch",
        BincodeCodec::<u32>::in_memory(1),
    )
    .unwrap();
    let err = open_cache(
        &registry,
        &config,
        &scope,
        "scratch",
        BincodeCodec::<u32>::in_memory(1),
    )
    .unwrap_err();
    assert!(matches!(err, CacheError::AlreadyOpen { .. }));
}

#[test]
fn closing_or_dropping_releases_the_slot() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");

    let cache = open_cache(
        &registry,
        &config,
        &scope,
        "symbols",
        BincodeCodec::<String>::new(1),
    )
    .unwrap();
    cache.close().unwrap();

    let cache = open_cache(
        &registry,
        &config,
        &scope,
        "symbols",
        BincodeCodec::<String>::new(1),
    )
    .unwrap();
    drop(cache);

    open_cache(
        &registry,
        &config,
        &scope,
        "symbols",
        BincodeCodec::<String>::new(1),
    )
    .unwrap();
}

#[test]
fn disk_caches_use_the_documented_path_layout() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");

    let cache = open_cache(
        &registry,
        &config,
        &scope,
        "symbols",
        BincodeCodec::<String>::new(3),
    )
    .unwrap();
    cache
        .put(
            FileId::from_raw(1),
            Fingerprint::from_raw(1),
            &"x".to_string(),
        )
        .unwrap();
    cache.close().unwrap();

    let dir = tmp.path().join(scope.as_str()).join("symbols");
    assert!(dir.join("symbols").is_file(), "missing map file");
    assert!(dir.join("symbols.lock").is_file(), "missing lock file");

    let sidecar: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join("symbols.json")).unwrap()).unwrap();
    assert_eq!(sidecar["name"], "symbols");
    assert_eq!(sidecar["format_version"], 3);
}

#[test]
fn invalid_cache_names_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");

    for name in ["", ".", "..", "a/b", "a\\b"] {
        let err = open_cache(
            &registry,
            &config,
            &scope,
            name,
            BincodeCodec::<String>::new(1),
        )
        .unwrap_err();
        assert!(
            matches!(err, CacheError::InvalidCacheName { .. }),
            "expected {name:?} to be rejected"
        );
    }
}
