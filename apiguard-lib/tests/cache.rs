mod common;

use std::sync::Arc;
use std::time::Duration;

use apiguard_lib::cache::{
    build_cache, cache_key, Cache, CacheEntry, CacheEntryOptions, FileCache, MemoryCache, NullCache,
};
use apiguard_lib::config::{CacheBackend, CacheConfig};
use bytes::Bytes;
use common::{request_parts, TestResult};
use http::{HeaderMap, HeaderValue, StatusCode};
use serial_test::serial;

fn entry(body: &'static str) -> CacheEntry {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    CacheEntry::new(StatusCode::OK, &headers, Bytes::from_static(body.as_bytes()))
}

fn session_opts() -> CacheEntryOptions {
    CacheEntryOptions { respect_cookies: vec!["kontext_sid".to_string()], ..Default::default() }
}

#[tokio::test]
async fn test_memory_cache_respects_allow_listed_cookies() -> TestResult<()> {
    let cache = MemoryCache::new(Duration::from_secs(60));
    let opts = session_opts();
    let alice = request_parts("/service/0/kontext/q?b=2&a=1", &[("cookie", "kontext_sid=alice; other=1")]);
    cache.set(&alice, &entry("[1]"), &opts).await?;

    let alice_again = request_parts("/service/0/kontext/q?a=1&b=2", &[("cookie", "other=2; kontext_sid=alice")]);
    let hit = cache.get(&alice_again, &opts).await?.ok_or("expected a hit")?;
    assert_eq!(hit.data, b"[1]");
    assert_eq!(hit.header_map().get("content-type"), Some(&HeaderValue::from_static("application/json")));

    let bob = request_parts("/service/0/kontext/q?a=1&b=2", &[("cookie", "kontext_sid=bob")]);
    assert!(cache.get(&bob, &opts).await?.is_none());
    assert_eq!(cache.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_memory_cache_expires_entries() -> TestResult<()> {
    let cache = MemoryCache::new(Duration::from_millis(50));
    let opts = CacheEntryOptions::default();
    let parts = request_parts("/service/0/treq/x", &[]);
    cache.set(&parts, &entry("{}"), &opts).await?;
    assert!(cache.get(&parts, &opts).await?.is_some());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(cache.get(&parts, &opts).await?.is_none());
    assert!(cache.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_file_cache_round_trip_and_expiry() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let cache = FileCache::new(dir.path(), Duration::from_secs(1));
    let opts = CacheEntryOptions::default();
    let parts = request_parts("/service/1/treq/x?q=1", &[]);
    let path = cache.entry_path(&cache_key(&parts, &opts));

    assert!(cache.get(&parts, &opts).await?.is_none());
    cache.set(&parts, &entry("{\"a\":1}"), &opts).await?;
    assert!(path.exists());

    let hit = cache.get(&parts, &opts).await?.ok_or("expected a hit")?;
    assert_eq!(hit.status_code(), StatusCode::OK);
    assert_eq!(hit.data, b"{\"a\":1}");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(cache.get(&parts, &opts).await?.is_none());
    assert!(!path.exists());
    Ok(())
}

#[tokio::test]
async fn test_null_cache_never_stores() -> TestResult<()> {
    let parts = request_parts("/service/0/treq/x", &[]);
    let opts = CacheEntryOptions::default();
    NullCache.set(&parts, &entry("{}"), &opts).await?;
    assert!(NullCache.get(&parts, &opts).await?.is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_build_cache_from_config() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let conf = CacheConfig {
        backend: CacheBackend::File,
        ttl_secs: 60,
        file_root: Some(dir.path().to_path_buf()),
        redis: None,
    };
    let cache = build_cache(&conf).await?;
    let parts = request_parts("/service/0/treq/x", &[]);
    let opts = CacheEntryOptions::default();
    cache.set(&parts, &entry("{}"), &opts).await?;
    assert!(cache.get(&parts, &opts).await?.is_some());

    let missing_root = CacheConfig { file_root: None, ..conf };
    assert!(build_cache(&missing_root).await.is_err());

    let missing_redis = CacheConfig { backend: CacheBackend::Redis, ..CacheConfig::default() };
    assert!(build_cache(&missing_redis).await.is_err());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_file_cache_concurrent_writers() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let cache = Arc::new(FileCache::new(dir.path(), Duration::from_secs(60)));
    let opts = CacheEntryOptions::default();
    let parts = request_parts("/service/0/treq/shared", &[]);

    let mut writers = tokio::task::JoinSet::new();
    for i in 0..16 {
        let cache = cache.clone();
        let opts = opts.clone();
        let parts = request_parts("/service/0/treq/shared", &[]);
        writers.spawn(async move {
            let body = format!("{{\"writer\":{i}}}");
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            let entry = CacheEntry::new(StatusCode::OK, &headers, Bytes::from(body));
            cache.set(&parts, &entry, &opts).await
        });
    }
    while let Some(res) = writers.join_next().await {
        res??;
    }

    let hit = cache.get(&parts, &opts).await?.ok_or("expected a hit")?;
    assert!(String::from_utf8(hit.data)?.starts_with("{\"writer\":"));

    let bucket = cache.entry_path(&cache_key(&parts, &opts));
    let leftovers = std::fs::read_dir(bucket.parent().ok_or("no bucket")?)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
        .count();
    assert_eq!(leftovers, 0);
    Ok(())
}
