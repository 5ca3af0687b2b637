use quill_cache::{
    open_cache, BincodeCodec, CacheConfig, CacheError, CacheRegistry, FileId, Fingerprint, ScopeId,
};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use tempfile::TempDir;

fn config(tmp: &TempDir) -> CacheConfig {
    CacheConfig {
        cache_root_override: Some(tmp.path().to_path_buf()),
    }
}

fn string_codec(version: u32) -> BincodeCodec<String> {
    BincodeCodec::new(version)
}

#[test]
fn entries_survive_a_restart_until_the_format_version_bumps() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");
    let key = FileId::from_raw(42);

    let cache = open_cache(&registry, &config, &scope, "symbols", string_codec(1)).unwrap();
    cache
        .put(key, Fingerprint::from_raw(100), &"A".to_string())
        .unwrap();
    cache.close().unwrap();

    // Same version: the entry is resurrected.
    let cache = open_cache(&registry, &config, &scope, "symbols", string_codec(1)).unwrap();
    let (fp, artifact) = cache.get(key).unwrap();
    assert_eq!(fp, Fingerprint::from_raw(100));
    assert_eq!(artifact, "A");
    cache.close().unwrap();

    // Bumped version: everything previously stored is discarded.
    let cache = open_cache(&registry, &config, &scope, "symbols", string_codec(2)).unwrap();
    assert!(cache.get(key).is_none());
    cache.close().unwrap();
}

#[test]
fn overwrite_returns_the_latest_entry() {
    let tmp = TempDir::new().unwrap();
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");
    let cache = open_cache(&registry, &config(&tmp), &scope, "folds", string_codec(1)).unwrap();

    let key = FileId::from_raw(7);
    cache
        .put(key, Fingerprint::from_raw(1), &"old".to_string())
        .unwrap();
    cache
        .put(key, Fingerprint::from_raw(2), &"new".to_string())
        .unwrap();

    let (fp, artifact) = cache.get(key).unwrap();
    assert_eq!(fp, Fingerprint::from_raw(2));
    assert_eq!(artifact, "new");
}

#[test]
fn removed_keys_miss() {
    let tmp = TempDir::new().unwrap();
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");
    let cache = open_cache(&registry, &config(&tmp), &scope, "folds", string_codec(1)).unwrap();

    let key = FileId::from_raw(3);
    cache
        .put(key, Fingerprint::from_raw(9), &"gone soon".to_string())
        .unwrap();
    cache.remove(key).unwrap();
    assert!(cache.get(key).is_none());

    // Removing an absent key stays a no-op.
    cache.remove(key).unwrap();
}

#[test]
fn reopening_with_the_same_version_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");

    let cache = open_cache(&registry, &config, &scope, "symbols", string_codec(1)).unwrap();
    for i in 0..10_u32 {
        cache
            .put(
                FileId::from_raw(i),
                Fingerprint::from_raw(u64::from(i)),
                &format!("artifact-{i}"),
            )
            .unwrap();
    }
    cache.close().unwrap();

    for _ in 0..2 {
        let cache = open_cache(&registry, &config, &scope, "symbols", string_codec(1)).unwrap();
        for i in 0..10_u32 {
            let (fp, artifact) = cache.get(FileId::from_raw(i)).unwrap();
            assert_eq!(fp, Fingerprint::from_raw(u64::from(i)));
            assert_eq!(artifact, format!("artifact-{i}"));
        }
        cache.close().unwrap();
    }
}

#[test]
fn corruption_of_one_entry_does_not_affect_others() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");
    let key_a = FileId::from_raw(1);
    let key_b = FileId::from_raw(2);

    let cache = open_cache(&registry, &config, &scope, "symbols", string_codec(1)).unwrap();
    cache
        .put(key_a, Fingerprint::from_raw(11), &"AAAA".to_string())
        .unwrap();
    cache
        .put(key_b, Fingerprint::from_raw(22), &"BBBB".to_string())
        .unwrap();
    cache.close().unwrap();

    // Flip the payload bytes of the first record only. Layout: 16-byte map
    // header, then per record a 9-byte header (key u32, op u8, len u32)
    // followed by the payload (8-byte fingerprint + bincode string, 20 bytes
    // for "AAAA").
    let map_file: PathBuf = tmp
        .path()
        .join(scope.as_str())
        .join("symbols")
        .join("symbols");
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&map_file)
        .unwrap();
    file.seek(SeekFrom::Start(16 + 9)).unwrap();
    file.write_all(&[0xff; 20]).unwrap();
    drop(file);

    let cache = open_cache(&registry, &config, &scope, "symbols", string_codec(1)).unwrap();
    assert!(cache.get(key_a).is_none());
    let (fp, artifact) = cache.get(key_b).unwrap();
    assert_eq!(fp, Fingerprint::from_raw(22));
    assert_eq!(artifact, "BBBB");
    cache.close().unwrap();

    // The corrupt entry was removed on first lookup, so a restart does not
    // hit it again.
    let cache = open_cache(&registry, &config, &scope, "symbols", string_codec(1)).unwrap();
    assert!(cache.get(key_a).is_none());
    assert!(cache.get(key_b).is_some());
    cache.close().unwrap();
}

#[test]
fn closed_caches_reject_writes_and_miss_reads() {
    let tmp = TempDir::new().unwrap();
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");
    let cache = open_cache(&registry, &config(&tmp), &scope, "folds", string_codec(1)).unwrap();

    let key = FileId::from_raw(1);
    cache
        .put(key, Fingerprint::from_raw(1), &"value".to_string())
        .unwrap();
    cache.close().unwrap();

    assert!(cache.get(key).is_none());
    assert!(matches!(
        cache.put(key, Fingerprint::from_raw(2), &"late".to_string()),
        Err(CacheError::Closed)
    ));
    assert!(matches!(cache.remove(key), Err(CacheError::Closed)));

    // close stays idempotent.
    cache.close().unwrap();
}

#[test]
fn non_durable_codecs_never_touch_disk() {
    let tmp = TempDir::new().unwrap();
    let registry = CacheRegistry::new();
    let scope = ScopeId::from_stable_key("project");
    let cache = open_cache(
        &registry,
        &config(&tmp),
        &scope,
        "scratch",
        BincodeCodec::<String>::in_memory(1),
    )
    .unwrap();

    let key = FileId::from_raw(5);
    cache
        .put(key, Fingerprint::from_raw(50), &"transient".to_string())
        .unwrap();
    let (fp, artifact) = cache.get(key).unwrap();
    assert_eq!(fp, Fingerprint::from_raw(50));
    assert_eq!(artifact, "transient");

    cache.remove(key).unwrap();
    assert!(cache.get(key).is_none());
    cache.close().unwrap();

    let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
    assert!(entries.is_empty(), "memory cache created files: {entries:?}");
}
