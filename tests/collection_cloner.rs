mod common;

use bson::doc;
use common::*;
use mongo_initial_sync::{CloneError, Cloner, CollectionCloner, Namespace};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const NS: &str = "testDb.a";

fn make_cloner<'a>(
    fx: &Fixture,
    client: &'a mut MockSourceClient,
    uuid: Uuid,
) -> CollectionCloner<'a> {
    CollectionCloner::new(
        Namespace::new("testDb", "a"),
        uuid,
        doc! {},
        Arc::clone(&fx.shared),
        &fx.source,
        client,
        Arc::new(fx.storage.clone()),
        Arc::clone(&fx.pool),
        fx.clock.clone(),
        16,
    )
}

fn push_happy_metadata(client: &MockSourceClient, count: u64) {
    client.push_count(Ok(count));
    client.push_list_indexes(Ok(vec![id_index_spec()]));
}

#[test]
fn count_sets_the_expected_total() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    push_happy_metadata(&client, 5);
    client.push_find_script(FindScript {
        batches: vec![],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    cloner.run().unwrap();

    let stats = cloner.stats();
    assert_eq!(stats.documents_to_copy, 5);
    assert!(stats.start.is_some());
    assert!(stats.end.is_some());
}

// Cloning is not gated on progress metrics: a failed count leaves the total
// at zero and the clone proceeds.
#[test]
fn non_network_count_failure_proceeds_with_zero_total() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    client.push_count(Err(CloneError::UpstreamCommand {
        code: 8000,
        message: "count not supported".to_string(),
    }));
    client.push_list_indexes(Ok(vec![id_index_spec()]));
    client.push_find_script(FindScript {
        batches: vec![],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    cloner.run().unwrap();

    let stats = cloner.stats();
    assert_eq!(stats.documents_to_copy, 0);
    assert_eq!(fx.storage.loader(NS).unwrap().commits(), 1);
}

#[test]
fn network_count_failure_is_retried_as_transient() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    client.push_count(Err(network_error("reset")));
    // The zero retry window makes the first failed reconnect fatal.
    client.push_reconnect_result(Err(network_error("still down")));
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    let err = cloner.run().unwrap_err();

    assert!(err.is_network());
    assert_eq!(fx.shared.total_retries(), 1);
    assert_eq!(client.reconnect_calls(), 1);
}

#[test]
fn created_collection_carries_the_source_uuid() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    push_happy_metadata(&client, 0);
    client.push_find_script(FindScript {
        batches: vec![],
        error: None,
    });
    let uuid = Uuid::new_v4();
    let mut cloner = make_cloner(&fx, &mut client, uuid);

    cloner.run().unwrap();

    let created = fx.storage.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].ns, Namespace::new("testDb", "a"));
    assert_eq!(created[0].uuid, uuid);
}

#[test]
fn id_index_is_separated_from_secondary_indexes() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    let secondary = doc! {"v": 2, "key": {"x": 1}, "name": "x_1"};
    client.push_count(Ok(0));
    client.push_list_indexes(Ok(vec![id_index_spec(), secondary.clone()]));
    client.push_find_script(FindScript {
        batches: vec![],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    cloner.run().unwrap();

    let created = fx.storage.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].id_index, id_index_spec());
    assert_eq!(created[0].secondary_indexes, vec![secondary]);
    assert_eq!(cloner.stats().indexes, 2);
}

#[test]
fn missing_id_index_is_tolerated() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    let secondary = doc! {"v": 2, "key": {"x": 1}, "name": "x_1"};
    client.push_count(Ok(0));
    client.push_list_indexes(Ok(vec![secondary.clone()]));
    client.push_find_script(FindScript {
        batches: vec![],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    cloner.run().unwrap();

    let created = fx.storage.created();
    assert!(created[0].id_index.is_empty());
    assert_eq!(created[0].secondary_indexes, vec![secondary]);
}

#[test]
fn index_spec_without_a_name_is_a_parse_error() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    client.push_count(Ok(0));
    client.push_list_indexes(Ok(vec![doc! {"v": 2, "key": {"x": 1}}]));
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    let err = cloner.run().unwrap_err();

    assert!(matches!(err, CloneError::FailedToParse { .. }));
    assert!(fx.storage.created().is_empty());
}

#[test]
fn query_streams_batches_into_the_loader() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    push_happy_metadata(&client, 4);
    client.push_find_script(FindScript {
        batches: vec![
            vec![doc! {"_id": 1}, doc! {"_id": 2}],
            vec![doc! {"_id": 3}, doc! {"_id": 4}],
        ],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    cloner.run().unwrap();

    let loader = fx.storage.loader(NS).unwrap();
    assert_eq!(loader.inserted_count(), 4);
    assert_eq!(loader.commits(), 1);
    let stats = cloner.stats();
    assert_eq!(stats.documents_copied, 4);
    assert_eq!(stats.received_batches, 2);
    // Batches may coalesce in the pending buffer, but every insert is one
    // fetched batch.
    assert!(stats.fetched_batches >= 1 && stats.fetched_batches <= 2);
}

// A restarted query replays from the beginning; the loader's duplicate
// handling keeps the document count identical to an uninterrupted run.
#[test]
fn query_restart_after_transient_error_does_not_double_count() {
    let fx = fixture_with_retry_window(Duration::from_secs(3600));
    let mut client = MockSourceClient::new();
    push_happy_metadata(&client, 4);
    client.push_find_script(FindScript {
        batches: vec![vec![doc! {"_id": 1}, doc! {"_id": 2}]],
        error: Some(network_error("connection reset mid-stream")),
    });
    client.push_find_script(FindScript {
        batches: vec![
            vec![doc! {"_id": 1}, doc! {"_id": 2}],
            vec![doc! {"_id": 3}, doc! {"_id": 4}],
        ],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    cloner.run().unwrap();

    let loader = fx.storage.loader(NS).unwrap();
    assert_eq!(loader.inserted_count(), 4);
    let stats = cloner.stats();
    assert_eq!(stats.documents_copied, 4);
    assert_eq!(stats.received_batches, 3);
    assert_eq!(client.reconnect_calls(), 1);
    assert_eq!(fx.shared.total_retries(), 1);
    // The outage closed when the reconnect succeeded.
    assert_eq!(fx.shared.retrying_operations(), 0);
}

#[test]
fn insert_failure_fails_the_clone() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    push_happy_metadata(&client, 2);
    let expected = CloneError::Storage {
        message: "duplicate key on non-_id index".to_string(),
    };
    fx.storage.set_insert_error(expected.clone());
    client.push_find_script(FindScript {
        batches: vec![vec![doc! {"_id": 1}, doc! {"_id": 2}]],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    let err = cloner.run().unwrap_err();

    assert_eq!(err, expected);
    assert_eq!(fx.shared.status().unwrap_err(), expected);
}

#[test]
fn commit_failure_is_fatal() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    push_happy_metadata(&client, 0);
    let expected = CloneError::Storage {
        message: "index build failed".to_string(),
    };
    fx.storage.set_commit_error(expected.clone());
    client.push_find_script(FindScript {
        batches: vec![],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());

    let err = cloner.run().unwrap_err();

    assert_eq!(err, expected);
    assert_eq!(fx.shared.status().unwrap_err(), expected);
}

#[test]
fn stop_after_list_indexes_makes_no_storage_calls() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    push_happy_metadata(&client, 0);
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());
    cloner.set_stop_after_stage_for_test("listIndexes");

    cloner.run().unwrap();

    assert!(fx.storage.created().is_empty());
}

#[test]
fn stats_snapshots_are_stable_without_progress() {
    let fx = fixture();
    let mut client = MockSourceClient::new();
    push_happy_metadata(&client, 3);
    client.push_find_script(FindScript {
        batches: vec![vec![doc! {"_id": 1}, doc! {"_id": 2}, doc! {"_id": 3}]],
        error: None,
    });
    let mut cloner = make_cloner(&fx, &mut client, Uuid::new_v4());
    let handle = cloner.stats_handle();

    cloner.run().unwrap();

    let first = handle.snapshot();
    let second = handle.snapshot();
    assert_eq!(first.documents_copied, second.documents_copied);
    assert_eq!(first.received_batches, second.received_batches);
    assert_eq!(first.fetched_batches, second.fetched_batches);
}
