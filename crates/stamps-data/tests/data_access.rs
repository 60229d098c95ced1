//! End-to-end behavior of the data-access facade on in-process doubles:
//! a scripted MySQL driver and an in-memory remote cache.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use stamps_cache::MemoryRemoteCache;
use stamps_data::{AppConfig, CacheTtl, DataAccess, DbError};
use stamps_db::testing::{Failure, ScriptedConnector};

fn config(environment: &str) -> AppConfig {
    AppConfig {
        environment: environment.into(),
        cache_endpoint: "memory".into(),
        db_retry_interval_ms: 1,
        db_keepalive_interval_secs: 0,
        ..AppConfig::default()
    }
}

async fn start(
    config: &AppConfig,
    connector: &ScriptedConnector,
    remote: &MemoryRemoteCache,
) -> DataAccess {
    DataAccess::start(config, Arc::new(connector.clone()), Arc::new(remote.clone())).await
}

async fn counted(data: &DataAccess, key: &str, calls: &AtomicUsize, value: &str) -> String {
    let value = value.to_string();
    data.get_or_compute(
        key,
        || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(value)
        },
        CacheTtl::Never,
    )
    .await
    .expect("infallible")
}

#[tokio::test]
async fn test_connection_succeeds_on_third_attempt() {
    let connector = ScriptedConnector::new();
    let config = AppConfig {
        db_max_retries: 3,
        db_min_connections: 0,
        ..config("production")
    };
    let data = start(&config, &connector, &MemoryRemoteCache::new()).await;

    connector.fail_next_connects(2);
    let mut conn = data.pool().get_connection().await.expect("third attempt");
    conn.execute("SELECT 1", &[]).await.expect("usable");

    assert_eq!(data.connection_stats().connection_attempts, 3);
    data.pool().release(conn).await;
    data.shutdown().await;
}

#[tokio::test]
async fn test_development_environment_never_caches() {
    let connector = ScriptedConnector::new();
    let remote = MemoryRemoteCache::new();
    let data = start(&config("development"), &connector, &remote).await;
    let query = "SELECT * FROM balances WHERE address = ?";

    for _ in 0..3 {
        data.execute_with_cache(query, &[], CacheTtl::Seconds(60))
            .await
            .expect("query");
    }

    assert_eq!(connector.executions_of(query), 3);
    assert!(remote.is_empty());
    let stats = data.cache_stats();
    assert_eq!(stats.mode, "bypass");
    assert_eq!(stats.local_entries, 0);
    data.shutdown().await;
}

#[tokio::test]
async fn test_cache_false_disables_caching_in_production() {
    let connector = ScriptedConnector::new();
    let remote = MemoryRemoteCache::new();
    let config = AppConfig {
        cache: false,
        ..config("production")
    };
    let data = start(&config, &connector, &remote).await;

    data.execute_with_cache("SELECT * FROM stamps", &[], CacheTtl::Never)
        .await
        .expect("query");
    data.execute_with_cache("SELECT * FROM stamps", &[], CacheTtl::Never)
        .await
        .expect("query");
    assert_eq!(connector.executions_of("SELECT * FROM stamps"), 2);
    assert!(remote.is_empty());
}

#[tokio::test]
async fn test_never_expiring_value_survives_process_restart() {
    let remote = MemoryRemoteCache::new();
    let calls = AtomicUsize::new(0);

    let first = start(&config("production"), &ScriptedConnector::new(), &remote).await;
    assert_eq!(counted(&first, "k", &calls, "v1").await, "v1");
    first.shutdown().await;

    // New process: fresh local tier, same remote cache.
    let second = start(&config("production"), &ScriptedConnector::new(), &remote).await;
    assert_eq!(second.cache_stats().local_entries, 0);
    assert_eq!(counted(&second, "k", &calls, "v2").await, "v1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    second.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_remote_serves_from_local_tier() {
    let remote = MemoryRemoteCache::new();
    remote.set_failing(true);
    let connector = ScriptedConnector::new();
    let data = start(&config("production"), &connector, &remote).await;
    assert!(!data.cache_stats().remote_available);

    let query = "SELECT * FROM src20_token_stats WHERE tick = ?";
    let first = data
        .execute_with_cache(query, &["stamp".into()], CacheTtl::Seconds(300))
        .await
        .expect("query");
    let second = data
        .execute_with_cache(query, &["stamp".into()], CacheTtl::Seconds(300))
        .await
        .expect("query");

    assert_eq!(first, second);
    assert_eq!(connector.executions_of(query), 1);
    assert_eq!(data.cache_stats().mode, "local");
    data.shutdown().await;
}

#[tokio::test]
async fn test_category_invalidation_forces_recompute() {
    let remote = MemoryRemoteCache::new();
    let connector = ScriptedConnector::new();
    let data = start(&config("production"), &connector, &remote).await;
    let balance = "SELECT amount FROM balances WHERE address = ?";
    let block = "SELECT MAX(block_index) FROM blocks";
    let addresses = ["bc1qa", "bc1qb", "bc1qc"];

    for _ in 0..2 {
        for address in addresses {
            data.execute_with_cache(balance, &[address.into()], CacheTtl::Seconds(60))
                .await
                .expect("balance");
        }
        data.execute_with_cache(block, &[], CacheTtl::Seconds(60))
            .await
            .expect("block");
    }
    assert_eq!(connector.executions_of(balance), 3);
    assert_eq!(connector.executions_of(block), 1);

    data.invalidate_by_category("balance").await;

    for address in addresses {
        data.execute_with_cache(balance, &[address.into()], CacheTtl::Seconds(60))
            .await
            .expect("balance");
    }
    data.execute_with_cache(block, &[], CacheTtl::Seconds(60))
        .await
        .expect("block");
    assert_eq!(connector.executions_of(balance), 6);
    assert_eq!(connector.executions_of(block), 1);
    data.shutdown().await;
}

#[tokio::test]
async fn test_pattern_invalidation_clears_matching_keys() {
    let remote = MemoryRemoteCache::new();
    let data = start(&config("production"), &ScriptedConnector::new(), &remote).await;
    let calls = AtomicUsize::new(0);

    counted(&data, "stamp:A1", &calls, "a").await;
    counted(&data, "stamp:A2", &calls, "b").await;
    counted(&data, "block:1", &calls, "c").await;

    data.invalidate_by_pattern("stamp:*").await;
    assert!(!remote.contains("stamp:A1"));
    assert!(remote.contains("block:1"));

    counted(&data, "stamp:A1", &calls, "a").await;
    counted(&data, "block:1", &calls, "c").await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    data.shutdown().await;
}

#[tokio::test]
async fn test_rejected_queries_surface_immediately() {
    let connector = ScriptedConnector::new();
    connector.fail_statements_containing("SELEC ", Failure::Syntax);
    let data = start(&config("production"), &connector, &MemoryRemoteCache::new()).await;

    let err = data
        .execute_with_cache("SELEC * FROM stamps", &[], CacheTtl::Seconds(60))
        .await
        .expect_err("syntax");
    assert!(matches!(err, DbError::Query { .. }));
    assert_eq!(connector.executions_of("SELEC "), 1);
    assert_eq!(data.cache_stats().local_entries, 0);
    data.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let connector = ScriptedConnector::new();
    let data = start(&config("production"), &connector, &MemoryRemoteCache::new()).await;
    assert_eq!(data.connection_stats().idle, 2);

    data.shutdown().await;
    assert_eq!(connector.closed(), 2);
    assert!(matches!(
        data.execute("SELECT 1", &[]).await,
        Err(DbError::PoolClosed)
    ));
}

#[tokio::test]
async fn test_stats_serialize_for_health_endpoints() {
    let data = start(
        &config("production"),
        &ScriptedConnector::new(),
        &MemoryRemoteCache::new(),
    )
    .await;

    let stats = serde_json::to_value(data.stats()).expect("serialize");
    assert_eq!(stats["pool"]["max"], 10);
    assert_eq!(stats["cache"]["mode"], "remote");
    assert_eq!(stats["cache"]["available_at_startup"], true);
    data.shutdown().await;
}
