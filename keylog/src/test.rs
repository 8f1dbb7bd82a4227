// --- Tests ---
use crate::clock::MockClock;
use crate::config::Config;
use crate::manager::{ConnectionStatus, KeylogClient};
use crate::memory::{FaultKind, MemoryStore, Operation};
use crate::types::{HitRecord, RawQueryOptions, SortOrder, TimePrecision};
use crate::KeylogError;

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

// Helper to initialize logging for tests
fn setup_logging() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("keylog=trace".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

const KEY: &str = "myKey";

// 2024-01-01T00:00:00Z
const START_MILLIS: i64 = 1_704_067_200_000;

fn test_config() -> Config {
    Config::new("debian", 8091, "default")
}

// Client with a frozen clock the test advances by hand
fn create_test_client(store: &MemoryStore) -> (KeylogClient<MemoryStore>, Arc<MockClock>) {
    create_test_client_with(store, test_config())
}

fn create_test_client_with(
    store: &MemoryStore,
    config: Config,
) -> (KeylogClient<MemoryStore>, Arc<MockClock>) {
    let clock = Arc::new(MockClock::with_time(
        Utc.timestamp_millis_opt(START_MILLIS).unwrap(),
    ));
    let client = KeylogClient::with_clock(store.clone(), config, clock.clone()).unwrap();
    (client, clock)
}

// Inserts `count` documents 5ms apart, returning their ids in insertion order
async fn insert_series(
    client: &KeylogClient<MemoryStore>,
    clock: &MockClock,
    key: &str,
    count: usize,
) -> Result<Vec<String>> {
    let mut ids = Vec::with_capacity(count);
    for seq in 0..count {
        ids.push(client.insert(key, &json!({ "seq": seq })).await?);
        clock.advance(Duration::milliseconds(5));
    }
    Ok(ids)
}

fn times(hits: &[HitRecord]) -> Vec<i64> {
    hits.iter().map(|h| h.time).collect()
}

#[tokio::test]
async fn test_insert_rejects_bad_key_without_contacting_store() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, _) = create_test_client(&store);

    for bad in ["", "my|Key"] {
        let err = client.insert(bad, "I_AM_DATA").await.unwrap_err();
        assert!(matches!(err, KeylogError::InvalidKey(_)), "got {:?}", err);
    }
    assert!(matches!(
        client.get("", RawQueryOptions::new()).await,
        Err(KeylogError::InvalidKey(_))
    ));
    assert!(matches!(
        client.remove("a|b", RawQueryOptions::new()).await,
        Err(KeylogError::InvalidKey(_))
    ));

    assert_eq!(store.stats().connects, 0);
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_insert_then_get_by_id_round_trips() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, _) = create_test_client(&store);

    let payload = json!({ "data": "I_AM_DATA", "nested": [1, 2, 3] });
    let id = client.insert(KEY, &payload).await?;
    info!("Inserted {}", id);
    assert!(id.ends_with("|myKey"));
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);

    let result = client.get(KEY, RawQueryOptions::new().ids([id.clone()])).await?;
    assert_eq!(result.hits.len(), 1);
    assert_eq!(result.hits[0].id, id);
    assert_eq!(result.hits[0].data, payload);
    assert_eq!(result.hits[0].time, START_MILLIS);
    assert_eq!(result.query.ids, Some(vec![id]));

    #[derive(serde::Deserialize, PartialEq, Debug)]
    struct Payload {
        data: String,
        nested: Vec<u32>,
    }
    let typed: Payload = result.hits[0].data_as()?;
    assert_eq!(
        typed,
        Payload {
            data: "I_AM_DATA".to_string(),
            nested: vec![1, 2, 3],
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_get_orders_hits_by_time() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 6).await?;

    let asc = client
        .get(KEY, RawQueryOptions::new().sort(SortOrder::Ascending))
        .await?;
    let desc = client
        .get(KEY, RawQueryOptions::new().sort(SortOrder::Descending))
        .await?;
    let default = client.get(KEY, RawQueryOptions::new()).await?;

    assert_eq!(asc.hits.len(), 6);
    assert!(times(&asc.hits).windows(2).all(|w| w[0] <= w[1]));
    assert!(times(&desc.hits).windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(asc.hits[0].data, json!({ "seq": 0 }));
    assert_eq!(desc.hits[0].data, json!({ "seq": 5 }));
    assert_eq!(default.query.sort, SortOrder::Descending);
    assert_eq!(times(&default.hits), times(&desc.hits));
    Ok(())
}

#[tokio::test]
async fn test_before_bounds_count_hits() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 5).await?;

    let all = client
        .get(KEY, RawQueryOptions::new().sort(SortOrder::Ascending))
        .await?
        .hits;

    for (i, hit) in all.iter().enumerate() {
        for sort in [SortOrder::Ascending, SortOrder::Descending] {
            let inclusive = client
                .get(KEY, RawQueryOptions::new().sort(sort).before_in(hit.time))
                .await?
                .hits;
            assert_eq!(inclusive.len(), i + 1, "beforeIn {} {:?}", hit.time, sort);
            assert!(inclusive.iter().all(|h| h.time <= hit.time));

            let exclusive = client
                .get(KEY, RawQueryOptions::new().sort(sort).before_ex(hit.time))
                .await?
                .hits;
            assert_eq!(exclusive.len(), i, "beforeEx {} {:?}", hit.time, sort);
            assert!(exclusive.iter().all(|h| h.time < hit.time));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_after_bounds_count_hits() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 5).await?;

    let all = client
        .get(KEY, RawQueryOptions::new().sort(SortOrder::Ascending))
        .await?
        .hits;

    for (i, hit) in all.iter().enumerate() {
        for sort in [SortOrder::Ascending, SortOrder::Descending] {
            let inclusive = client
                .get(KEY, RawQueryOptions::new().sort(sort).after_in(hit.time))
                .await?
                .hits;
            assert_eq!(inclusive.len(), all.len() - i);

            let exclusive = client
                .get(KEY, RawQueryOptions::new().sort(sort).after_ex(hit.time))
                .await?
                .hits;
            assert_eq!(exclusive.len(), all.len() - i - 1);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_interval_matches_same_set_in_both_orders() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 6).await?;

    let all = client
        .get(KEY, RawQueryOptions::new().sort(SortOrder::Ascending))
        .await?
        .hits;
    let (first, fourth) = (all[0].time, all[3].time);

    let mut matched = Vec::new();
    for sort in [SortOrder::Ascending, SortOrder::Descending] {
        // Given in order, then backwards; the reversed pair is repaired.
        for (after, before) in [(first, fourth), (fourth, first)] {
            let result = client
                .get(
                    KEY,
                    RawQueryOptions::new().sort(sort).after_in(after).before_in(before),
                )
                .await?;
            assert_eq!(result.hits.len(), 4, "{:?} after={} before={}", sort, after, before);
            assert_eq!(result.query.after_in, Some(first));
            assert_eq!(result.query.before_in, Some(fourth));
            let mut set = times(&result.hits);
            set.sort();
            matched.push(set);
        }
    }
    assert!(matched.windows(2).all(|w| w[0] == w[1]));

    let open = client
        .get(
            KEY,
            RawQueryOptions::new()
                .sort(SortOrder::Descending)
                .after_ex(first)
                .before_ex(fourth),
        )
        .await?;
    assert_eq!(times(&open.hits), vec![all[2].time, all[1].time]);
    Ok(())
}

#[tokio::test]
async fn test_skip_and_limit_page_through_results() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 7).await?;

    let page = |skip| {
        RawQueryOptions::new()
            .sort(SortOrder::Ascending)
            .skip(skip)
            .limit(3)
    };
    let mut seqs = Vec::new();
    for skip in [0, 3, 6] {
        let hits = client.get(KEY, page(skip)).await?.hits;
        seqs.extend(hits.iter().map(|h| h.data["seq"].as_u64().unwrap()));
    }
    assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5, 6]);

    let query = client.get(KEY, RawQueryOptions::new()).await?.query;
    assert_eq!((query.skip, query.limit), (0, 100));
    Ok(())
}

#[tokio::test]
async fn test_keys_sharing_a_prefix_stay_separate() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, "ab", 2).await?;
    insert_series(&client, &clock, "ab1", 3).await?;
    insert_series(&client, &clock, "abc", 4).await?;

    assert_eq!(client.get("ab", RawQueryOptions::new()).await?.hits.len(), 2);
    assert_eq!(client.get("ab1", RawQueryOptions::new()).await?.hits.len(), 3);
    assert_eq!(client.get("abc", RawQueryOptions::new()).await?.hits.len(), 4);
    assert_eq!(client.remove("ab", RawQueryOptions::new()).await?.nb_removals, 2);
    assert_eq!(store.len(), 7);
    Ok(())
}

#[tokio::test]
async fn test_foreign_ids_are_rejected() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    let ids = insert_series(&client, &clock, "myKey1", 1).await?;
    let connects = store.stats().connects;

    let err = client
        .get("myKey", RawQueryOptions::new().ids(ids.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, KeylogError::KeyMismatch { .. }), "got {:?}", err);

    let err = client
        .remove("myKey", RawQueryOptions::new().ids(ids))
        .await
        .unwrap_err();
    assert!(matches!(err, KeylogError::KeyMismatch { .. }), "got {:?}", err);

    assert_eq!(store.stats().gets, 0);
    assert_eq!(store.stats().deletes, 0);
    assert_eq!(store.stats().connects, connects);
    assert_eq!(store.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_ids_are_dropped_from_hits() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    let ids = insert_series(&client, &clock, KEY, 3).await?;
    client
        .remove(KEY, RawQueryOptions::new().ids([ids[1].clone()]))
        .await?;

    let result = client
        .get(
            KEY,
            RawQueryOptions::new()
                .sort(SortOrder::Ascending)
                .ids(ids.clone()),
        )
        .await?;
    let got: Vec<&str> = result.hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(got, vec![ids[0].as_str(), ids[2].as_str()]);
    Ok(())
}

#[tokio::test]
async fn test_remove_is_idempotent() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    let ids = insert_series(&client, &clock, KEY, 2).await?;

    let options = RawQueryOptions::new().ids([ids[0].clone()]);
    let first = client.remove(KEY, options.clone()).await?;
    let second = client.remove(KEY, options).await?;

    assert_eq!(first.nb_removals, 1);
    assert_eq!(second.nb_removals, 0);
    assert_eq!(store.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_remove_by_interval() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 6).await?;
    let all = client
        .get(KEY, RawQueryOptions::new().sort(SortOrder::Ascending))
        .await?
        .hits;

    let removed = client
        .remove(KEY, RawQueryOptions::new().after_ex(all[1].time).before_in(all[4].time))
        .await?;
    assert_eq!(removed.nb_removals, 3);
    assert_eq!(removed.query.after_ex, Some(all[1].time));

    let left = client
        .get(KEY, RawQueryOptions::new().sort(SortOrder::Ascending))
        .await?;
    assert_eq!(times(&left.hits), vec![all[0].time, all[1].time, all[5].time]);
    Ok(())
}

#[tokio::test]
async fn test_remove_surfaces_hard_delete_failure() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 3).await?;
    store.fail_next(Operation::Delete, FaultKind::Backend);

    let err = client.remove(KEY, RawQueryOptions::new()).await.unwrap_err();
    assert!(matches!(err, KeylogError::Store(_)), "got {:?}", err);
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);

    // Deletes already issued still complete; nothing is restored.
    for _ in 0..100 {
        if store.len() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert_eq!(store.len(), 1);
    assert_eq!(store.stats().deletes, 3);
    Ok(())
}

#[tokio::test]
async fn test_empty_results_short_circuit() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, _) = create_test_client(&store);

    // An interval that cannot match never reaches the store.
    let result = client
        .get(KEY, RawQueryOptions::new().after_ex(START_MILLIS).before_ex(START_MILLIS))
        .await?;
    assert!(result.hits.is_empty());
    assert_eq!(store.stats().connects, 0);
    assert_eq!(store.stats().scans, 0);

    // A key with no documents scans once and fetches nothing.
    let result = client.get(KEY, RawQueryOptions::new().limit(5)).await?;
    assert!(result.hits.is_empty());
    assert_eq!(result.query.limit, 5);
    assert_eq!(store.stats().scans, 1);
    assert_eq!(store.stats().gets, 0);

    let removed = client.remove(KEY, RawQueryOptions::new()).await?;
    assert_eq!(removed.nb_removals, 0);
    assert_eq!(store.stats().deletes, 0);
    Ok(())
}

#[tokio::test]
async fn test_timeout_forces_reconnect() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 2).await?;
    assert_eq!(store.stats().connects, 1);

    store.fail_next(Operation::Scan, FaultKind::Timeout);
    let err = client.get(KEY, RawQueryOptions::new()).await.unwrap_err();
    assert!(err.is_timeout(), "got {:?}", err);
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);

    let result = client.get(KEY, RawQueryOptions::new()).await?;
    assert_eq!(result.hits.len(), 2);
    assert_eq!(store.stats().connects, 2);

    store.fail_next(Operation::Get, FaultKind::Timeout);
    let err = client.get(KEY, RawQueryOptions::new()).await.unwrap_err();
    assert!(err.is_timeout(), "got {:?}", err);
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    client.get(KEY, RawQueryOptions::new()).await?;
    assert_eq!(store.stats().connects, 3);

    // Timeouts while inserting and deleting behave the same way.
    store.fail_next(Operation::Put, FaultKind::Timeout);
    assert!(client.insert(KEY, &1).await.unwrap_err().is_timeout());
    store.fail_next(Operation::Delete, FaultKind::Timeout);
    assert!(client
        .remove(KEY, RawQueryOptions::new())
        .await
        .unwrap_err()
        .is_timeout());
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_other_errors_keep_connection() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 2).await?;

    store.fail_next(Operation::Get, FaultKind::Backend);
    let err = client.get(KEY, RawQueryOptions::new()).await.unwrap_err();
    assert!(matches!(err, KeylogError::Store(_)), "got {:?}", err);
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);

    client.get(KEY, RawQueryOptions::new()).await?;
    assert_eq!(store.stats().connects, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_connect_retries_on_next_call() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, _) = create_test_client(&store);

    store.fail_next(Operation::Connect, FaultKind::Connection);
    let err = client.insert(KEY, "x").await.unwrap_err();
    assert!(matches!(err, KeylogError::Connection(_)), "got {:?}", err);
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);

    client.insert(KEY, "x").await?;
    assert_eq!(store.stats().connects, 2);
    assert_eq!(store.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_is_a_connection_error() -> Result<()> {
    setup_logging();
    let store = MemoryStore::builder().password("secret").build();
    let (client, _) = create_test_client(&store);
    let err = client.get(KEY, RawQueryOptions::new()).await.unwrap_err();
    assert!(matches!(err, KeylogError::Connection(_)), "got {:?}", err);

    let mut config = test_config();
    config.password = Some("secret".to_string());
    let (client, _) = create_test_client_with(&store, config);
    client.get(KEY, RawQueryOptions::new()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_calls_share_one_connection() -> Result<()> {
    setup_logging();
    let store = MemoryStore::builder()
        .connect_delay(std::time::Duration::from_millis(50))
        .build();
    let (client, _) = create_test_client(&store);

    let payloads: Vec<_> = (0..8).map(|i| json!({ "n": i })).collect();
    let inserts = payloads.iter().map(|payload| client.insert(KEY, payload));
    let ids = join_all(inserts)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    assert_eq!(store.stats().connects, 1);
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 8, "ids must not collide on a frozen clock");
    assert_eq!(client.get(KEY, RawQueryOptions::new()).await?.hits.len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_millisecond_precision_ids() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let mut config = test_config();
    config.precision = TimePrecision::Millis;
    let (client, clock) = create_test_client_with(&store, config);
    let ids = insert_series(&client, &clock, KEY, 4).await?;

    assert!(ids[0].starts_with(&format!("{:020}|", START_MILLIS)));
    let hits = client
        .get(
            KEY,
            RawQueryOptions::new()
                .sort(SortOrder::Ascending)
                .after_in(START_MILLIS + 5)
                .before_ex(START_MILLIS + 15),
        )
        .await?
        .hits;
    assert_eq!(times(&hits), vec![START_MILLIS + 5, START_MILLIS + 10]);
    Ok(())
}

#[tokio::test]
async fn test_options_from_json() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let (client, clock) = create_test_client(&store);
    insert_series(&client, &clock, KEY, 4).await?;

    let raw = RawQueryOptions::from_json(&json!({
        "sort": 1,
        "skip": "two",
        "limit": -1,
        "afterIn": START_MILLIS + 5,
    }));
    let result = client.get(KEY, raw).await?;
    assert_eq!(result.query.sort, SortOrder::Ascending);
    assert_eq!((result.query.skip, result.query.limit), (0, 100));
    assert_eq!(result.hits.len(), 3);
    assert_eq!(
        serde_json::to_value(&result.query)?,
        json!({ "sort": "ASC", "skip": 0, "limit": 100, "afterIn": START_MILLIS + 5 })
    );
    Ok(())
}

#[tokio::test]
async fn test_status_reports_connecting_during_connect() -> Result<()> {
    setup_logging();
    let store = MemoryStore::builder()
        .connect_delay(std::time::Duration::from_millis(100))
        .build();
    let (client, _) = create_test_client(&store);

    let insert = client.insert(KEY, "x");
    tokio::pin!(insert);
    tokio::select! {
        done = &mut insert => panic!("connect finished early: {:?}", done),
        _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
    }
    assert_eq!(client.connection_status(), ConnectionStatus::Connecting);

    insert.await?;
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_connect_leaves_client_disconnected() -> Result<()> {
    setup_logging();
    let store = MemoryStore::builder()
        .connect_delay(std::time::Duration::from_millis(100))
        .build();
    let (client, _) = create_test_client(&store);

    let cancelled = tokio::time::timeout(
        std::time::Duration::from_millis(10),
        client.insert(KEY, "x"),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);

    client.insert(KEY, "x").await?;
    assert_eq!(store.stats().connects, 2);
    assert_eq!(store.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_explicit_limit_overrides_configured_default() -> Result<()> {
    setup_logging();
    let store = MemoryStore::new();
    let mut config = test_config();
    config.defaults.limit = 2;
    let (client, clock) = create_test_client_with(&store, config);
    insert_series(&client, &clock, KEY, 5).await?;

    let capped = client.get(KEY, RawQueryOptions::new()).await?;
    assert_eq!(capped.hits.len(), 2);
    assert_eq!(capped.query.limit, 2);

    let all = client.get(KEY, RawQueryOptions::new().limit(10)).await?;
    assert_eq!(all.hits.len(), 5);
    assert!(all.hits.get(6).is_none());
    Ok(())
}
