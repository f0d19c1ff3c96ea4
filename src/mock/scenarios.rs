//! End-to-end client scenarios against the loopback cluster

use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::client::{Client, Task, UdfLanguage};
use crate::command::partition_tracker::PartitionFilter;
use crate::command::{BatchRead, BatchReadRecord, Bin, IndexType, Key, Operation, Record, Statement};
use crate::config::{
    BasePolicy, BatchPolicy, QueryPolicy, Replica, ScanPolicy, WritePolicy, TTL_DONT_EXPIRE,
};
use crate::utils::Error;

/// Connect and wait until every node and the partition map are known.
fn connect(mock: &MockCluster, nodes: usize) -> Client {
    let client = Client::new(mock.client_policy(), mock.seeds()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.node_names().len() < nodes || !client.is_connected() {
        assert!(Instant::now() < deadline, "cluster did not settle: {:?}", client.node_names());
        thread::sleep(Duration::from_millis(10));
    }
    client
}

fn key(mock: &MockCluster, set: &str, id: i64) -> Key {
    Key::new(mock.namespace(), set, id).unwrap()
}

fn load(client: &Client, mock: &MockCluster, set: &str, count: i64) -> Vec<Key> {
    let policy = WritePolicy::default();
    (0..count)
        .map(|i| {
            let k = key(mock, set, i);
            client
                .put(&policy, &k, &[Bin::new("id", i), Bin::new("name", format!("user-{}", i))])
                .unwrap();
            k
        })
        .collect()
}

fn digests(records: &[Record]) -> HashSet<[u8; DIGEST_SIZE]> {
    records
        .iter()
        .map(|r| *r.key.as_ref().unwrap().digest())
        .collect()
}

#[test]
fn test_discovers_peers_from_one_seed() {
    let mock = MockCluster::start(3).unwrap();
    let client = connect(&mock, 3);

    let mut names = client.node_names();
    names.sort();
    assert_eq!(names, vec![mock.node_name(0), mock.node_name(1), mock.node_name(2)]);
    for i in 0..3 {
        let node = client.get_node(&mock.node_name(i)).unwrap();
        assert!(node.is_active());
    }
    client.close();
}

#[test]
fn test_single_record_round_trip() {
    let mock = MockCluster::start(2).unwrap();
    let client = connect(&mock, 2);
    let write = WritePolicy::default();
    let read = BasePolicy::default();
    let k = key(&mock, "demo", 1);

    client
        .put(&write, &k, &[Bin::new("count", 1i64), Bin::new("label", "x")])
        .unwrap();
    assert!(client.exists(&read, &k).unwrap());

    let record = client.get(&read, &k, None).unwrap();
    assert_eq!(record.generation, 1);
    assert_eq!(record.bin("count"), Some(&Value::Int(1)));
    assert_eq!(record.bin("label"), Some(&Value::String("x".into())));

    client.add(&write, &k, &[Bin::new("count", 4i64)]).unwrap();
    client.append(&write, &k, &[Bin::new("label", "yz")]).unwrap();
    client.prepend(&write, &k, &[Bin::new("label", "w")]).unwrap();
    let record = client.get(&read, &k, Some(&["label"])).unwrap();
    assert_eq!(record.bin("label"), Some(&Value::String("wxyz".into())));
    assert!(record.bin("count").is_none());

    let record = client
        .operate(&write, &k, &[Operation::add(Bin::new("count", 1i64)), Operation::get_bin("count")])
        .unwrap();
    assert_eq!(record.bin("count"), Some(&Value::Int(6)));

    client.touch(&write, &k).unwrap();
    let header = client.get_header(&read, &k).unwrap();
    assert_eq!(header.generation, 6);
    assert!(header.bins.is_empty());

    assert!(client.delete(&write, &k).unwrap());
    assert!(!client.exists(&read, &k).unwrap());
    assert!(!client.delete(&write, &k).unwrap());
    let err = client.get(&read, &k, None).unwrap_err();
    assert!(err.is_key_not_found());
}

#[test]
fn test_create_only_rejects_existing_record() {
    let mock = MockCluster::start(1).unwrap();
    let client = connect(&mock, 1);
    let k = key(&mock, "demo", 7);
    client.put(&WritePolicy::default(), &k, &[Bin::new("a", 1i64)]).unwrap();

    let create_only = WritePolicy {
        record_exists_action: crate::config::RecordExistsAction::CreateOnly,
        ..Default::default()
    };
    let err = client.put(&create_only, &k, &[Bin::new("a", 2i64)]).unwrap_err();
    assert_eq!(err.result_code(), ResultCode::KeyExistsError);
}

#[test]
fn test_ttl_round_trip() {
    let mock = MockCluster::start(2).unwrap();
    let client = connect(&mock, 2);
    let read = BasePolicy::default();

    let forever = key(&mock, "ttl", 1);
    let policy = WritePolicy {
        expiration: TTL_DONT_EXPIRE,
        ..Default::default()
    };
    client.put(&policy, &forever, &[Bin::new("a", 1i64)]).unwrap();
    let record = client.get(&read, &forever, None).unwrap();
    assert_eq!(record.expiration, TTL_DONT_EXPIRE);
    assert!(record.never_expires());

    let short = key(&mock, "ttl", 2);
    let policy = WritePolicy {
        expiration: 100,
        ..Default::default()
    };
    client.put(&policy, &short, &[Bin::new("a", 1i64)]).unwrap();
    let record = client.get(&read, &short, None).unwrap();
    assert!((98..=100).contains(&record.expiration), "ttl {}", record.expiration);
}

#[test]
fn test_batch_with_failing_node_returns_partial_results() {
    let mock = MockCluster::start(4).unwrap();
    let client = connect(&mock, 4);
    let keys = load(&client, &mock, "batch", 100);

    mock.fail_with(1, ResultCode::ServerError);
    let policy = BatchPolicy {
        base: BasePolicy {
            max_retries: 0,
            ..Default::default()
        },
        allow_partial_results: true,
        ..Default::default()
    };
    let results = client.batch_get(&policy, &keys, None).unwrap();

    assert_eq!(results.values.len(), keys.len());
    let on_failed_node = keys.iter().filter(|k| k.partition_id() % 4 == 1).count();
    let missing = results.values.iter().filter(|r| r.is_none()).count();
    assert_eq!(missing, on_failed_node);
    for (k, record) in keys.iter().zip(&results.values) {
        if k.partition_id() % 4 != 1 {
            let record = record.as_ref().unwrap();
            assert!(record.bin("id").is_some());
        }
    }
    let error = results.error.unwrap();
    assert!(error.chain().any(|e| e.result_code() == ResultCode::ServerError));
}

#[test]
fn test_batch_network_error_is_retried_and_reported() {
    let mock = MockCluster::start(3).unwrap();
    let client = connect(&mock, 3);
    let keys = load(&client, &mock, "netfail", 60);
    let failed = mock.node_name(1);

    mock.drop_data_requests(1);
    let policy = BatchPolicy {
        base: BasePolicy {
            max_retries: 1,
            replica: Replica::Master,
            ..Default::default()
        },
        allow_partial_results: true,
        ..Default::default()
    };
    let results = client.batch_get(&policy, &keys, None).unwrap();
    for (k, record) in keys.iter().zip(&results.values) {
        assert_eq!(record.is_some(), k.partition_id() % 3 != 1, "key {:?}", k);
    }
    let error = results.error.unwrap();
    let network: Vec<&Error> = error.chain().filter(|e| e.is_network()).collect();
    // first attempt and its retry
    assert_eq!(network.len(), 2, "{:?}", error);
    assert!(network.iter().all(|e| e.node() == Some(failed.as_str())));

    // a sequence retry moves the keys to the proles
    let policy = BatchPolicy {
        base: BasePolicy {
            max_retries: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let results = client.batch_get(&policy, &keys, None).unwrap();
    assert!(results.is_complete());
    assert!(results.values.iter().all(Option::is_some));
}

#[test]
fn test_batch_get_complex_reads_per_key_bins() {
    let mock = MockCluster::start(2).unwrap();
    let client = connect(&mock, 2);
    load(&client, &mock, "complex", 4);

    let mut records = vec![
        BatchReadRecord::with_bins(key(&mock, "complex", 0), &["id"]),
        BatchReadRecord::with_bins(key(&mock, "complex", 3), &["id"]),
        BatchReadRecord::new(key(&mock, "complex", 1), BatchRead::Get(None)),
        BatchReadRecord::new(key(&mock, "complex", 2), BatchRead::Header),
        BatchReadRecord::with_bins(key(&mock, "complex", 99), &["id"]),
    ];
    let error = client
        .batch_get_complex(&BatchPolicy::default(), &mut records)
        .unwrap();
    assert!(error.is_none());

    for (i, id) in [(0, 0i64), (1, 3)] {
        let record = records[i].record.as_ref().unwrap();
        assert_eq!(record.bin("id"), Some(&Value::Int(id)));
        assert!(record.bin("name").is_none());
    }
    let all = records[2].record.as_ref().unwrap();
    assert_eq!(all.bin("name"), Some(&Value::String("user-1".into())));
    let header = records[3].record.as_ref().unwrap();
    assert!(header.bins.is_empty());
    assert_eq!(header.generation, 1);
    assert!(records[4].record.is_none());
}

#[test]
fn test_batch_reports_missing_keys() {
    let mock = MockCluster::start(2).unwrap();
    let client = connect(&mock, 2);
    let mut keys = load(&client, &mock, "batch", 10);
    keys.push(key(&mock, "batch", 1000));

    let results = client.batch_exists(&BatchPolicy::default(), &keys).unwrap();
    assert!(results.is_complete());
    assert_eq!(results.values.iter().filter(|e| **e).count(), 10);
    assert!(!results.values[10]);
}

#[test]
fn test_scan_delivers_every_record_once_when_node_dies() {
    let mock = MockCluster::start(4).unwrap();
    let client = connect(&mock, 4);
    load(&client, &mock, "scan", 400);
    assert_eq!(mock.record_count(), 400);

    mock.kill_after_records(1, 20);
    let records = client
        .scan_all(&ScanPolicy::default(), mock.namespace(), "scan", &[])
        .unwrap()
        .collect_records()
        .unwrap();

    assert_eq!(records.len(), 400);
    assert_eq!(digests(&records).len(), 400);
}

#[test]
fn test_scan_pages_resume_with_partition_filter() {
    let mock = MockCluster::start(3).unwrap();
    let client = connect(&mock, 3);
    load(&client, &mock, "pages", 200);

    let policy = ScanPolicy {
        max_records: 50,
        ..Default::default()
    };
    let filter = PartitionFilter::all();
    let mut seen = Vec::new();
    let mut pages = 0;
    while !filter.is_done() {
        pages += 1;
        assert!(pages <= 20, "scan never finished");
        let page = client
            .scan_partitions(&policy, filter.clone(), mock.namespace(), "pages", &["id"])
            .unwrap()
            .collect_records()
            .unwrap();
        assert!(page.len() <= 50);
        seen.extend(page);
    }
    assert!(pages >= 4);
    assert_eq!(seen.len(), 200);
    assert_eq!(digests(&seen).len(), 200);
    assert!(seen.iter().all(|r| r.bin("name").is_none()));
}

#[test]
fn test_scan_node_covers_its_master_partitions() {
    let mock = MockCluster::start(2).unwrap();
    let client = connect(&mock, 2);
    let keys = load(&client, &mock, "owned", 60);

    let records = client
        .scan_node(&ScanPolicy::default(), &mock.node_name(0), mock.namespace(), "owned", &[])
        .unwrap()
        .collect_records()
        .unwrap();
    let expected = keys.iter().filter(|k| k.partition_id() % 2 == 0).count();
    assert_eq!(records.len(), expected);
}

#[test]
fn test_query_range_filter() {
    let mock = MockCluster::start(3).unwrap();
    let client = connect(&mock, 3);
    load(&client, &mock, "people", 40);

    let statement = Statement::new(mock.namespace(), "people")
        .with_index_name("id_idx")
        .with_bins(&["id"])
        .with_filter(Filter::range("id", 10, 19));
    let records = client
        .query(&QueryPolicy::default(), &statement)
        .unwrap()
        .collect_records()
        .unwrap();

    let mut ids: Vec<i64> = records
        .iter()
        .map(|r| match r.bin("id") {
            Some(Value::Int(i)) => *i,
            other => panic!("unexpected id {:?}", other),
        })
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (10..=19).collect::<Vec<_>>());
}

#[test]
fn test_query_node_reads_one_node() {
    let mock = MockCluster::start(2).unwrap();
    let client = connect(&mock, 2);
    let keys = load(&client, &mock, "qnode", 40);
    let node = client.get_node(&mock.node_name(1)).unwrap();
    let owned = |k: &&Key| k.partition_id() % 2 == 1;

    let statement = Statement::new(mock.namespace(), "qnode");
    let records = client
        .query_node(&QueryPolicy::default(), &node, &statement)
        .unwrap()
        .collect_records()
        .unwrap();
    assert_eq!(records.len(), keys.iter().filter(owned).count());

    // the node answers from its own partitions only
    let statement = Statement::new(mock.namespace(), "qnode")
        .with_index_name("id_idx")
        .with_filter(Filter::range("id", 0, 9));
    let records = client
        .query_node(&QueryPolicy::default(), &node, &statement)
        .unwrap()
        .collect_records()
        .unwrap();
    let expected: HashSet<_> = keys[..10].iter().filter(owned).map(|k| *k.digest()).collect();
    assert_eq!(digests(&records), expected);
}

#[test]
fn test_udf_register_list_remove() {
    let mock = MockCluster::start(2).unwrap();
    let client = connect(&mock, 2);
    let source = b"function hello(rec)\n  return 'hi'\nend\n";

    let task = client
        .register_udf(&Default::default(), source, "hello.lua", UdfLanguage::Lua)
        .unwrap();
    task.wait_till_complete(Duration::from_millis(10), Duration::from_secs(2))
        .unwrap();

    let udfs = client.list_udf(&Default::default()).unwrap();
    assert_eq!(udfs.len(), 1);
    assert_eq!(udfs[0].filename, "hello.lua");
    assert_eq!(udfs[0].language, UdfLanguage::Lua);
    assert_eq!(udfs[0].hash.len(), 40);

    client.remove_udf(&Default::default(), "hello.lua").unwrap();
    assert!(client.list_udf(&Default::default()).unwrap().is_empty());
}

#[test]
fn test_renamed_node_is_deactivated() {
    let mock = MockCluster::start(3).unwrap();
    let client = connect(&mock, 3);
    let old_name = mock.node_name(2);
    let node = client.get_node(&old_name).unwrap();

    mock.rename(2, "RENAMED");
    for _ in 0..2 {
        let _ = client.cluster().tend();
    }

    assert!(!node.is_active());
    let still_listed = client
        .nodes()
        .iter()
        .any(|n| n.name() == old_name && n.is_active());
    assert!(!still_listed);
}

#[test]
fn test_killed_node_partitions_fail_over() {
    let mock = MockCluster::start(3).unwrap();
    let client = connect(&mock, 3);
    let dead = mock.node_name(1);

    mock.kill(1);
    // partition 1 was mastered by the dead node; its prole takes over
    let heir = mock.node_name(mock.replica_node(1, 0).unwrap());
    assert_eq!(heir, mock.node_name(2));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let map = client.cluster().partition_map();
        let master = map
            .get(mock.namespace())
            .and_then(|p| p.master(1))
            .map(|n| n.name().to_string());
        if !client.node_names().contains(&dead) && master.as_deref() == Some(heir.as_str()) {
            break;
        }
        assert!(Instant::now() < deadline, "map did not fail over: {:?}", master);
        thread::sleep(Duration::from_millis(20));
    }

    // writes go to masters only, so every partition must have one again
    let keys = load(&client, &mock, "failover", 30);
    assert!(keys.iter().any(|k| k.partition_id() % 3 == 1));
    let results = client.batch_exists(&BatchPolicy::default(), &keys).unwrap();
    assert!(results.values.iter().all(|e| *e));
}

#[test]
fn test_info_and_admin_commands() {
    let mock = MockCluster::start(2).unwrap();
    let client = connect(&mock, 2);
    let node = client.get_node(&mock.node_name(1)).unwrap();

    let info = client
        .request_info(&Default::default(), &node, &["node", "cluster-name"])
        .unwrap();
    assert_eq!(info.get("node").map(String::as_str), Some(mock.node_name(1).as_str()));
    assert_eq!(info.get("cluster-name").map(String::as_str), Some("mock"));

    client
        .truncate(&Default::default(), mock.namespace(), "demo", None)
        .unwrap();
    let task = client
        .create_index(&Default::default(), mock.namespace(), "demo", "id_idx", "id", IndexType::Numeric)
        .unwrap();
    task.wait_till_complete(Duration::from_millis(10), Duration::from_secs(2))
        .unwrap();
    client
        .drop_index(&Default::default(), mock.namespace(), "demo", "id_idx")
        .unwrap();
    client
        .create_user(&Default::default(), "alice", "secret", &["read"])
        .unwrap();
}
