// Copyright 2020 Joyent, Inc.

mod common;

use dynopool::connection_pool::types::HostHealth;
use dynopool::error::Error;
use dynopool::operation::{OpName, Value};
use dynopool::pipeline::PipelineState;
use dynopool::retry::RetryKind;

use common::{
    client_with, one_rack, pool_options, two_racks, MemoryStore,
    SharedSupplier,
};

fn retry_n_times(retries: u32, cross_zone: bool) -> Option<RetryKind> {
    Some(RetryKind::RetryNTimes {
        retries,
        allow_cross_zone_fallback: cross_zone,
    })
}

#[test]
fn pipeline_results_in_submission_order() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(one_rack()));

    let mut pipeline = client.pipelined();
    assert_eq!(pipeline.state(), PipelineState::Created);

    let a = pipeline.set("a", "1").unwrap();
    let b = pipeline.incr("a").unwrap();
    let c = pipeline.get("a").unwrap();
    assert_eq!(pipeline.state(), PipelineState::Open);
    assert_eq!(pipeline.pending(), 3);

    // Nothing is available before sync
    assert_eq!(b.get(), Err(Error::ResultNotReady));
    assert!(!c.is_ready());

    let results = pipeline.sync().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(pipeline.state(), PipelineState::Flushed);
    assert_eq!(pipeline.pending(), 0);

    assert_eq!(a.get(), Ok(Value::Status(String::from("OK"))));
    assert_eq!(b.get(), Ok(Value::Int(2)));
    assert_eq!(c.get().unwrap().as_i64(), Some(2));
    assert_eq!(results[1], b.get());
    assert_eq!(c.position(), 2);
}

#[test]
fn pipeline_replays_ledger_after_transport_failure() {
    let store = MemoryStore::new();
    let mut options = pool_options(2);
    options.retry_policy = retry_n_times(1, false);
    let client = client_with(options, &store, SharedSupplier::new(one_rack()));

    // Keep every key on one host so the pipeline accepts all three
    let owner = client.resolve(b"a").unwrap();
    let mut pipeline = client.pipelined();
    pipeline.set("a", "10").unwrap();
    let bound = pipeline.host().cloned().unwrap();
    assert_eq!(bound, owner);

    pipeline.incr("a").unwrap();
    let last = pipeline.get("a").unwrap();
    assert_eq!(store.connects(), 1);

    store.fail_next_flushes(1);
    let results = pipeline.sync().unwrap();

    // Each command ran exactly once, in order, on the replacement connection
    let executed = store.executed();
    let names: Vec<OpName> = executed.iter().map(|e| e.name).collect();
    assert_eq!(names, vec![OpName::Set, OpName::Incr, OpName::Get]);
    assert_eq!(store.connects(), 2);
    assert!(executed.iter().all(|e| e.connection == executed[0].connection));
    assert_eq!(results[1], Ok(Value::Int(11)));
    assert_eq!(last.get().unwrap().as_string(), Some(String::from("11")));
    assert_eq!(store.value("a"), Some(String::from("11")));
}

#[test]
fn pipeline_application_error_is_not_replayed() {
    let store = MemoryStore::new();
    let mut options = pool_options(2);
    options.retry_policy = retry_n_times(3, false);
    let client = client_with(options, &store, SharedSupplier::new(one_rack()));

    let mut pipeline = client.pipelined();
    pipeline.set("a", "not a number").unwrap();
    let b = pipeline.incr("a").unwrap();
    let c = pipeline.get("a").unwrap();

    let results = pipeline.sync().unwrap();
    assert!(results[0].is_ok());
    match &results[1] {
        Err(Error::ApplicationError(_)) => (),
        other => panic!("expected ApplicationError, got {:?}", other),
    }
    assert!(b.get().is_err());
    assert_eq!(
        c.get().unwrap().as_string(),
        Some(String::from("not a number"))
    );
    assert_eq!(store.executed().len(), 3);
    assert_eq!(store.connects(), 1);
}

#[test]
fn pipeline_run_once_fails_every_pending_result() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(one_rack()));

    let mut pipeline = client.pipelined();
    let a = pipeline.set("a", "1").unwrap();
    let b = pipeline.get("a").unwrap();

    store.fail_next_flushes(1);
    let err = pipeline.sync().unwrap_err();
    match &err {
        Error::RetryExhausted { attempts, last } => {
            assert_eq!(*attempts, 1);
            assert!(last.is_connection_failure());
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert_eq!(a.get(), Err(err.clone()));
    assert_eq!(b.get(), Err(err));
    assert!(store.executed().is_empty());
    assert_eq!(pipeline.pending(), 0);
}

#[test]
fn pipeline_reconnects_after_failed_sync() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(one_rack()));

    let mut pipeline = client.pipelined();
    let first = pipeline.set("a", "1").unwrap();
    store.fail_next_flushes(1);
    assert!(pipeline.sync().is_err());
    assert!(first.get().is_err());
    assert_eq!(store.connects(), 1);

    // Commands appended after a failed sync go out on a new connection
    let second = pipeline.set("a", "2").unwrap();
    let results = pipeline.sync().unwrap();
    assert_eq!(results, vec![Ok(Value::Status(String::from("OK")))]);
    assert_eq!(second.get(), Ok(Value::Status(String::from("OK"))));
    assert_eq!(pipeline.state(), PipelineState::Flushed);
    assert_eq!(store.connects(), 2);
    assert_eq!(store.executed().len(), 1);
    assert_eq!(store.value("a"), Some(String::from("2")));
}

#[test]
fn pipeline_rejected_flush_keeps_host_up() {
    let store = MemoryStore::new();
    let mut options = pool_options(2);
    options.failure_threshold = Some(1);
    options.retry_policy = retry_n_times(2, false);
    let client = client_with(options, &store, SharedSupplier::new(one_rack()));

    let mut pipeline = client.pipelined();
    let pending = pipeline.set("a", "1").unwrap();
    let bound = pipeline.host().cloned().unwrap();

    store.reject_next_flushes(1);
    match pipeline.sync() {
        Err(Error::ApplicationError(_)) => (),
        other => panic!("expected ApplicationError, got {:?}", other),
    }
    match pending.get() {
        Err(Error::ApplicationError(_)) => (),
        other => panic!("expected ApplicationError, got {:?}", other),
    }

    // Not replayed, and neither the host nor the connection was blamed
    assert!(store.executed().is_empty());
    assert_eq!(client.pool().host_health(&bound), Some(HostHealth::Up));
    let stats = client.pool().host_stats(&bound).unwrap();
    assert_eq!(u32::from(stats.idle_connections), 1);

    pipeline.set("a", "2").unwrap();
    pipeline.sync().unwrap();
    assert_eq!(store.connects(), 1);
    assert_eq!(store.value("a"), Some(String::from("2")));
}

#[test]
fn pipeline_fails_over_to_remote_rack() {
    let store = MemoryStore::new();
    let mut options = pool_options(2);
    options.retry_policy = retry_n_times(2, true);
    let client =
        client_with(options, &store, SharedSupplier::new(two_racks()));

    let mut pipeline = client.pipelined();
    pipeline.set("k", "v").unwrap();
    let local = pipeline.host().cloned().unwrap();
    assert_eq!(local.rack, "rack1");
    let got = pipeline.get("k").unwrap();

    store.fail_next_flushes(1);
    store.refuse(&local);
    pipeline.sync().unwrap();

    let remote = pipeline.host().cloned().unwrap();
    assert_eq!(remote.rack, "rack2");
    assert_eq!(remote.ring_token(), local.ring_token());
    assert_eq!(got.get().unwrap().as_string(), Some(String::from("v")));
    assert!(store.executed().iter().all(|e| e.host == remote.name));
}

#[test]
fn pipeline_rejects_key_owned_by_another_host() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(one_rack()));

    let first = client.resolve(b"first").unwrap();
    let other = (0..1000)
        .map(|i| format!("key{}", i))
        .find(|k| client.resolve(k.as_bytes()).unwrap() != first)
        .unwrap();

    let mut pipeline = client.pipelined();
    pipeline.set("first", "1").unwrap();
    match pipeline.get(other.as_str()) {
        Err(Error::KeyNotOnPipelineHost(key)) => assert_eq!(key, first.key()),
        other => panic!("expected KeyNotOnPipelineHost, got {:?}", other.err()),
    }
    // The rejected command left no trace in the ledger
    assert_eq!(pipeline.pending(), 1);
}

#[test]
fn pipeline_close() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(one_rack()));

    let mut pipeline = client.pipelined();
    let pending = pipeline.incr("a").unwrap();
    pipeline.close();
    assert_eq!(pipeline.state(), PipelineState::Closed);

    // Unsynced commands are discarded
    assert_eq!(pending.get(), Err(Error::PipelineClosed));
    assert!(store.executed().is_empty());

    assert_eq!(pipeline.get("a").err(), Some(Error::PipelineClosed));
    assert_eq!(pipeline.sync().err(), Some(Error::PipelineClosed));

    // Closing again is harmless
    pipeline.close();
    assert_eq!(pipeline.state(), PipelineState::Closed);
}

#[test]
fn pipeline_empty_sync() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(one_rack()));

    let mut pipeline = client.pipelined();
    assert_eq!(pipeline.sync(), Ok(Vec::new()));
    assert_eq!(pipeline.state(), PipelineState::Flushed);
    assert_eq!(store.connects(), 0);
}

#[test]
fn client_execute_and_retry() {
    let store = MemoryStore::new();
    let mut options = pool_options(2);
    options.retry_policy = retry_n_times(2, true);
    let client =
        client_with(options, &store, SharedSupplier::new(two_racks()));

    assert_eq!(
        client.set("greeting", "hello"),
        Ok(Value::Status(String::from("OK")))
    );
    assert_eq!(
        client.get("greeting").unwrap().as_string(),
        Some(String::from("hello"))
    );
    assert_eq!(client.incr("n"), Ok(1));
    assert_eq!(client.incr_by("n", 4), Ok(5));
    assert_eq!(client.del("n"), Ok(1));
    assert!(client.get("n").unwrap().is_nil());

    // A failed flush moves the operation to another replica
    store.fail_next_flushes(1);
    assert_eq!(client.incr("n"), Ok(1));

    // Application errors are returned as-is
    match client.incr("greeting") {
        Err(Error::ApplicationError(_)) => (),
        other => panic!("expected ApplicationError, got {:?}", other),
    }
}

#[test]
fn client_run_once_gives_up() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(one_rack()));

    store.fail_next_flushes(1);
    match client.get("a") {
        Err(Error::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 1),
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert!(client.get("a").unwrap().is_nil());
}

#[test]
fn client_retries_missing_reply() {
    let store = MemoryStore::new();
    let mut options = pool_options(2);
    options.retry_policy = retry_n_times(1, false);
    let client = client_with(options, &store, SharedSupplier::new(one_rack()));

    store.drop_next_replies(1);
    assert_eq!(client.set("a", "1"), Ok(Value::Status(String::from("OK"))));
    assert_eq!(store.value("a"), Some(String::from("1")));
    // The connection that answered with nothing was discarded
    assert_eq!(store.connects(), 2);
}

#[test]
fn client_run_once_missing_reply() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(one_rack()));

    store.drop_next_replies(1);
    match client.get("a") {
        Err(Error::RetryExhausted { attempts, last }) => {
            assert_eq!(attempts, 1);
            assert!(last.is_connection_failure());
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert!(client.get("a").unwrap().is_nil());
}

#[test]
fn client_rejected_command_keeps_host_up() {
    let store = MemoryStore::new();
    let mut options = pool_options(2);
    options.failure_threshold = Some(1);
    let client = client_with(options, &store, SharedSupplier::new(one_rack()));
    let owner = client.resolve(b"a").unwrap();

    store.reject_next_flushes(1);
    match client.set("a", "1") {
        Err(Error::ApplicationError(_)) => (),
        other => panic!("expected ApplicationError, got {:?}", other),
    }
    assert_eq!(client.pool().host_health(&owner), Some(HostHealth::Up));

    // The same connection serves the next command
    assert_eq!(client.set("a", "1"), Ok(Value::Status(String::from("OK"))));
    assert_eq!(store.connects(), 1);
}

#[test]
fn client_without_hosts() {
    let store = MemoryStore::new();
    let client =
        client_with(pool_options(2), &store, SharedSupplier::new(Vec::new()));

    assert_eq!(client.get("a"), Err(Error::NoAvailableHost));
    let mut pipeline = client.pipelined();
    assert_eq!(pipeline.get("a").err(), Some(Error::NoAvailableHost));
}
