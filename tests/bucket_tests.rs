use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use netpol::bucket::{CountBucket, Counts, FlowStat, FwdBucket, PathBucket, PathHooks};
use netpol::packet::Packet;
use netpol::policy::Policy;
use netpol::pred::{Match, Pred};
use netpol::types::{field_map, Field, Value};

fn rule_match(sw: u64, dstport: u64) -> Match {
    Match::from_map(field_map(vec![
        ("switch", Value::Int(sw)),
        ("dstport", Value::Int(dstport)),
    ]))
}

/// A stats reply entry as a switch reports it: the match without the switch
/// field, which the handler adds back from the reply's origin.
fn reply_stat(dstport: u64, cookie: u64, packets: i64, bytes: i64) -> FlowStat {
    FlowStat {
        pattern: Match::from_map(field_map(vec![("dstport", Value::Int(dstport))])),
        priority: 10,
        cookie,
        packet_count: packets,
        byte_count: bytes,
    }
}

fn record_counts(bucket: &CountBucket) -> Arc<Mutex<Vec<Counts>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    bucket.register_callback(Arc::new(move |c| {
        sink.lock().unwrap().push(c);
    }));
    log
}

/// Wires the bucket's stats query to mark the given switches outstanding.
fn wire_stats_query(bucket: &Arc<CountBucket>, switches: &'static [u64]) {
    let b = bucket.clone();
    bucket.set_stats_query(Arc::new(move || {
        for sw in switches {
            b.add_outstanding_switch(*sw);
        }
        !switches.is_empty()
    }));
}

#[test]
fn test_counts_survive_classifier_reinstall() {
    // A rule sees 100 packets (2000 bytes), is removed and reinstalled under
    // a new classifier version, then sees 50 more (1000 bytes): a pull after
    // the reinstall must report 150 packets and 3000 bytes.
    let bucket = CountBucket::new();
    let log = record_counts(&bucket);

    bucket.start_update();
    bucket.add_match(rule_match(1, 80), 10, 1, false);
    bucket.finish_update();

    // classifier replace: v1 out, v2 in
    bucket.start_update();
    bucket.delete_match(rule_match(1, 80), 10, 1);
    bucket.add_match(rule_match(1, 80), 10, 2, false);
    wire_stats_query(&bucket, &[1]);
    bucket.finish_update();

    // the switch confirms removal with the v1 rule's lifetime counters
    bucket.handle_flow_removed(rule_match(1, 80), 10, 1, 100, 2000);

    bucket.pull_stats();
    bucket.handle_flow_stats_reply(1, vec![reply_stat(80, 2, 50, 1000)]);

    let log = log.lock().unwrap();
    assert_eq!(log.as_slice(), &[Counts { packets: 150, bytes: 3000 }]);
}

#[test]
fn test_existing_rules_are_discounted_once() {
    // A rule that predates the bucket already counted 30 packets; only
    // traffic after the bucket's creation may be reported.
    let bucket = CountBucket::new();
    let log = record_counts(&bucket);

    assert!(bucket.is_new());
    bucket.start_update();
    bucket.add_match(rule_match(1, 80), 10, 1, true);
    wire_stats_query(&bucket, &[1]);
    let b = bucket.clone();
    bucket.set_existing_stats_query(Arc::new(move || {
        b.add_outstanding_switch(1);
        true
    }));
    bucket.finish_update();
    assert!(!bucket.is_new());

    // bootstrap reply: 30 pre-existing packets, 600 bytes
    bucket.handle_flow_stats_reply(1, vec![reply_stat(80, 1, 30, 600)]);
    assert_eq!(
        log.lock().unwrap().last(),
        Some(&Counts { packets: 0, bytes: 0 })
    );

    // later: the rule's cumulative counter reads 45 packets / 900 bytes
    bucket.pull_stats();
    bucket.handle_flow_stats_reply(1, vec![reply_stat(80, 1, 45, 900)]);
    assert_eq!(
        log.lock().unwrap().last(),
        Some(&Counts { packets: 15, bytes: 300 })
    );
}

#[test]
fn test_pull_without_rules_reports_synchronously() {
    let bucket = CountBucket::new();
    let log = record_counts(&bucket);
    bucket.start_update();
    bucket.finish_update();
    bucket.pull_stats();
    assert_eq!(log.lock().unwrap().as_slice(), &[Counts::default()]);
}

#[test]
fn test_callbacks_fire_once_when_last_switch_replies() {
    let bucket = CountBucket::new();
    let log = record_counts(&bucket);

    bucket.start_update();
    bucket.add_match(rule_match(1, 80), 10, 1, false);
    bucket.add_match(rule_match(2, 80), 10, 1, false);
    wire_stats_query(&bucket, &[1, 2]);
    bucket.finish_update();

    bucket.pull_stats();
    bucket.handle_flow_stats_reply(1, vec![reply_stat(80, 1, 7, 700)]);
    assert!(log.lock().unwrap().is_empty(), "one switch still outstanding");
    bucket.handle_flow_stats_reply(2, vec![reply_stat(80, 1, 5, 500)]);
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Counts { packets: 12, bytes: 1200 }]
    );
}

#[test]
fn test_duplicate_add_match_is_idempotent() {
    let bucket = CountBucket::new();
    bucket.start_update();
    bucket.add_match(rule_match(1, 80), 10, 1, false);
    bucket.add_match(rule_match(1, 80), 10, 1, false);
    bucket.finish_update();
    assert_eq!(bucket.get_matches().len(), 1);

    // the same match under a new version is a distinct entry
    bucket.start_update();
    bucket.add_match(rule_match(1, 80), 10, 2, false);
    bucket.finish_update();
    assert_eq!(bucket.get_matches().len(), 2);
}

#[test]
#[should_panic(expected = "not marked for deletion")]
fn test_flow_removed_without_delete_is_a_contract_violation() {
    let bucket = CountBucket::new();
    bucket.start_update();
    bucket.add_match(rule_match(1, 80), 10, 1, false);
    bucket.finish_update();
    bucket.handle_flow_removed(rule_match(1, 80), 10, 1, 1, 100);
}

#[test]
fn test_queued_packets_fold_into_persistent_counts() {
    let bucket = CountBucket::new();
    let log = record_counts(&bucket);
    bucket.capture(
        Packet::new()
            .with(Field::HeaderLen, 14u64)
            .with(Field::PayloadLen, 86u64),
    );
    bucket.apply();
    bucket.pull_stats();
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Counts { packets: 1, bytes: 100 }]
    );
}

#[test]
fn test_fwd_bucket_delivers_each_packet() {
    let bucket = FwdBucket::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    bucket.register_callback(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    bucket.capture(Packet::new().with(Field::Switch, 1u64));
    bucket.capture(Packet::new().with(Field::Switch, 2u64));
    bucket.apply();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(bucket.pending().is_empty());
}

fn linear_hooks() -> PathHooks {
    PathHooks {
        topology: Arc::new(|| {
            Policy::matching(field_map(vec![
                ("switch", Value::Int(1)),
                ("outport", Value::Int(2)),
            ])) >> Policy::Modify(field_map(vec![
                ("switch", Value::Int(2)),
                ("inport", Value::Int(1)),
                ("outport", Value::None),
            ]))
        }),
        forwarding: Arc::new(|| {
            (Policy::Filter(Pred::matching(field_map(vec![("switch", Value::Int(1))])))
                >> Policy::Fwd(2))
                + (Policy::Filter(Pred::matching(field_map(vec![("switch", Value::Int(2))])))
                    >> Policy::Fwd(9))
                // a query leaf the mapper must strip before simulation
                + Policy::CountBucket(CountBucket::new())
        }),
        egress: Arc::new(|| {
            Pred::matching(field_map(vec![
                ("switch", Value::Int(2)),
                ("outport", Value::Int(9)),
            ]))
        }),
    }
}

#[test]
fn test_trajectories_end_exactly_at_egress() {
    let bucket = PathBucket::new();
    bucket.set_runtime_hooks(linear_hooks());

    let pkt = Packet::new().with(Field::Switch, 1u64).with(Field::Inport, 4u64);
    let paths = bucket.trajectories(&pkt);

    assert_eq!(paths.len(), 1, "one forwarding path, counted once");
    let path = &paths[0];
    assert_eq!(path.len(), 3);
    assert_eq!(path[0].get(&Field::Switch), Some(&Value::Int(1)));
    assert_eq!(path[1].get(&Field::Switch), Some(&Value::Int(2)));
    // egress appears exclusively as the last element
    let egress = Pred::matching(field_map(vec![
        ("switch", Value::Int(2)),
        ("outport", Value::Int(9)),
    ]));
    for located in &path[..path.len() - 1] {
        assert!(!egress.eval(located));
    }
    assert!(egress.eval(path.last().unwrap()));
}

#[test]
fn test_path_bucket_callbacks_receive_trajectories() {
    let bucket = PathBucket::new();
    bucket.set_runtime_hooks(linear_hooks());
    let lengths = Arc::new(Mutex::new(Vec::new()));
    let sink = lengths.clone();
    bucket.register_callback(Arc::new(move |_, paths| {
        sink.lock().unwrap().push(paths.len());
    }));
    bucket.capture(Packet::new().with(Field::Switch, 1u64));
    bucket.apply();
    assert_eq!(lengths.lock().unwrap().as_slice(), &[1]);
}
