use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::packet::Packet;
use crate::policy::Policy;
use crate::pred::{Match, Pred};
use crate::types::{Field, Value};

/// Callback invoked with each packet captured by a [`FwdBucket`].
pub type PacketCallback = Arc<dyn Fn(&Packet) + Send + Sync>;

/// Callback invoked with a packet and its network trajectories.
pub type PathCallback = Arc<dyn Fn(&Packet, &[Vec<Packet>]) + Send + Sync>;

/// Callback invoked with the byte/packet totals of a counter pull.
pub type CountCallback = Arc<dyn Fn(Counts) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
/// Packet and byte totals reported to count callbacks.
///
/// Signed: while existing-rule counters are being seeded, the persistent
/// component transiently runs negative.
pub struct Counts {
    pub packets: i64,
    pub bytes: i64,
}

#[derive(Default)]
/// Delivers individual packets sent to the controller to registered
/// callbacks. Compiles to a `Controller` action.
pub struct FwdBucket {
    queue: Mutex<HashSet<Packet>>,
    callbacks: Mutex<Vec<PacketCallback>>,
}

impl FwdBucket {
    pub fn new() -> Arc<FwdBucket> {
        Arc::new(FwdBucket::default())
    }

    pub fn register_callback(&self, f: PacketCallback) {
        self.callbacks.lock().expect("callback lock poisoned").push(f);
    }

    /// Queue a packet copy for the next `apply`.
    pub fn capture(&self, pkt: Packet) {
        self.queue.lock().expect("bucket lock poisoned").insert(pkt);
    }

    /// Drains the queue, firing each callback on each packet.
    pub fn apply(&self) {
        let drained: Vec<Packet> = {
            let mut queue = self.queue.lock().expect("bucket lock poisoned");
            queue.drain().collect()
        };
        let callbacks = self.callbacks.lock().expect("callback lock poisoned").clone();
        for pkt in &drained {
            debug!(?pkt, "fwd bucket delivering packet");
            for f in &callbacks {
                f(pkt);
            }
        }
    }

    /// Packets currently queued (primarily for tests).
    pub fn pending(&self) -> Vec<Packet> {
        self.queue
            .lock()
            .expect("bucket lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl fmt::Debug for FwdBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FwdBucket({:p})", self)
    }
}

/// Runtime functions a [`PathBucket`] needs to replay a packet's journey:
/// the one-hop topology policy, the current forwarding policy, and the
/// filter that is true at network egress.
pub struct PathHooks {
    pub topology: Arc<dyn Fn() -> Policy + Send + Sync>,
    pub forwarding: Arc<dyn Fn() -> Policy + Send + Sync>,
    pub egress: Arc<dyn Fn() -> Pred + Send + Sync>,
}

/// Bound on trajectory recursion; forwarding loops otherwise never egress.
pub const MAX_TRAJECTORY_HOPS: usize = 64;

#[derive(Default)]
/// Delivers packets together with the set of trajectories they take through
/// the network under the current forwarding policy.
pub struct PathBucket {
    queue: Mutex<HashSet<Packet>>,
    callbacks: Mutex<Vec<PathCallback>>,
    hooks: Mutex<Option<PathHooks>>,
}

impl PathBucket {
    pub fn new() -> Arc<PathBucket> {
        Arc::new(PathBucket::default())
    }

    pub fn register_callback(&self, f: PathCallback) {
        self.callbacks.lock().expect("callback lock poisoned").push(f);
    }

    pub fn set_runtime_hooks(&self, hooks: PathHooks) {
        *self.hooks.lock().expect("hooks lock poisoned") = Some(hooks);
    }

    pub fn capture(&self, pkt: Packet) {
        self.queue.lock().expect("bucket lock poisoned").insert(pkt);
    }

    /// Drains the queue; each callback receives the packet and its
    /// trajectories.
    pub fn apply(&self) {
        let drained: Vec<Packet> = {
            let mut queue = self.queue.lock().expect("bucket lock poisoned");
            queue.drain().collect()
        };
        let callbacks = self.callbacks.lock().expect("callback lock poisoned").clone();
        for pkt in &drained {
            let paths = self.trajectories(pkt);
            info!(?pkt, paths = paths.len(), "path bucket delivering packet");
            for f in &callbacks {
                f(pkt, &paths);
            }
        }
    }

    /// Enumerates the packet's trajectories: ordered lists of located
    /// packets at successive switch ingresses, whose last element is the
    /// packet state at network egress. Returns nothing until runtime hooks
    /// are installed.
    pub fn trajectories(&self, pkt: &Packet) -> Vec<Vec<Packet>> {
        let hooks = self.hooks.lock().expect("hooks lock poisoned");
        let hooks = match hooks.as_ref() {
            Some(h) => h,
            None => return Vec::new(),
        };
        let topology = (hooks.topology)();
        let forwarding = strip_queries((hooks.forwarding)());
        let egress = (hooks.egress)();
        packet_paths(pkt, &forwarding, &topology, &egress, MAX_TRAJECTORY_HOPS)
    }
}

impl fmt::Debug for PathBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathBucket({:p})", self)
    }
}

/// Replaces every query leaf with drop, so path simulation is not swallowed
/// by (or double-delivered to) other registered queries.
fn strip_queries(policy: Policy) -> Policy {
    match policy {
        Policy::FwdBucket(_) | Policy::PathBucket(_) | Policy::CountBucket(_) => Policy::drop(),
        Policy::Parallel(ps) => Policy::Parallel(ps.into_iter().map(strip_queries).collect()),
        Policy::Sequential(ps) => Policy::Sequential(ps.into_iter().map(strip_queries).collect()),
        Policy::If(branch) => Policy::if_else(
            branch.pred.clone(),
            strip_queries(branch.then_pol.clone()),
            strip_queries(branch.else_pol.clone()),
        ),
        Policy::Dynamic(d) => strip_queries(d.policy()),
        other => other,
    }
}

/// One step of trajectory enumeration. A forwarded successor at network
/// egress terminates its path there; only successors still inside the
/// network move across a topology hop and recurse. Egress is therefore
/// exclusively the last element and never double-counted.
fn packet_paths(
    pkt: &Packet,
    forwarding: &Policy,
    topology: &Policy,
    egress: &Pred,
    hops_left: usize,
) -> Vec<Vec<Packet>> {
    if egress.eval(pkt) {
        return vec![vec![pkt.clone()]];
    }
    if hops_left == 0 {
        return Vec::new();
    }
    let mut paths = Vec::new();
    for fwd in forwarding.eval(pkt) {
        if egress.eval(&fwd) {
            paths.push(vec![pkt.clone(), fwd]);
            continue;
        }
        for moved in topology.eval(&fwd) {
            for suffix in packet_paths(&moved, forwarding, topology, egress, hops_left - 1) {
                let mut path = vec![pkt.clone()];
                path.extend(suffix);
                paths.push(path);
            }
        }
    }
    paths
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// Identity of an installed rule a bucket counts against: its match, its
/// priority, and the classifier generation it belongs to. The version keeps
/// the same (match, priority) distinct across reinstalls.
pub struct MatchEntry {
    #[serde(rename = "match")]
    pub pattern: Match,
    pub priority: u16,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
/// Bookkeeping attached to a [`MatchEntry`].
pub struct MatchStatus {
    /// The rule was removed from the classifier; we keep the entry until the
    /// switch confirms removal with final counters.
    pub to_be_deleted: bool,
    /// The rule predates the bucket; its first stats reply is subtracted so
    /// pre-bucket traffic is not counted.
    pub existing_rule: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
/// One entry of a flow-stats reply from a switch.
pub struct FlowStat {
    #[serde(rename = "match")]
    pub pattern: Match,
    pub priority: u16,
    /// The classifier generation the rule was installed under.
    pub cookie: u64,
    pub packet_count: i64,
    pub byte_count: i64,
}

#[derive(Error, Debug)]
/// Errors from the stats-reply parsing helper.
pub enum StatsError {
    #[error("invalid flow stats json at {path}: {source}")]
    InvalidJson {
        path: String,
        source: serde_json::Error,
    },
}

/// Parses a JSON flow-stats reply payload into [`FlowStat`] entries,
/// reporting the path of the offending element on failure.
pub fn parse_flow_stats(payload: &str) -> Result<Vec<FlowStat>, StatsError> {
    let de = &mut serde_json::Deserializer::from_str(payload);
    serde_path_to_error::deserialize(de).map_err(|e| StatsError::InvalidJson {
        path: e.path().to_string(),
        source: e.into_inner(),
    })
}

/// Asks the runtime to issue flow-stats requests for the bucket's rules;
/// returns whether at least one switch query is now in flight.
pub type StatsQueryFn = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct CountState {
    matches: HashMap<MatchEntry, MatchStatus>,
    outstanding_switches: Vec<u64>,
    packets: i64,
    bytes: i64,
    persistent_packets: i64,
    persistent_bytes: i64,
    in_update: bool,
    new_bucket: bool,
    stats_query: Option<StatsQueryFn>,
    existing_stats_query: Option<StatsQueryFn>,
}

/// Counts packets and bytes via switch flow counters.
///
/// A count bucket does not capture packets in steady state; it tracks the
/// set of installed rules that reference it and reconstructs totals from
/// flow-stats replies and flow-removed counters, carrying persistent counts
/// across classifier reinstalls.
///
/// Classifier installs are bracketed by [`start_update`]/[`finish_update`];
/// counter events wait on a condition variable while an update is in
/// progress, because the update spans many runtime callbacks and a plain
/// lock could not be held across them.
///
/// [`start_update`]: CountBucket::start_update
/// [`finish_update`]: CountBucket::finish_update
pub struct CountBucket {
    state: Mutex<CountState>,
    in_update_cv: Condvar,
    queue: Mutex<HashSet<Packet>>,
    callbacks: Mutex<Vec<CountCallback>>,
}

impl Default for CountBucket {
    fn default() -> Self {
        CountBucket {
            state: Mutex::new(CountState {
                new_bucket: true,
                ..CountState::default()
            }),
            in_update_cv: Condvar::new(),
            queue: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

impl CountBucket {
    pub fn new() -> Arc<CountBucket> {
        Arc::new(CountBucket::default())
    }

    pub fn register_callback(&self, f: CountCallback) {
        self.callbacks.lock().expect("callback lock poisoned").push(f);
    }

    /// True until the first install-update completes.
    pub fn is_new(&self) -> bool {
        self.state.lock().expect("count state lock poisoned").new_bucket
    }

    /// Queue a packet delivered in-process (before rules reach switches).
    pub fn capture(&self, pkt: Packet) {
        self.queue.lock().expect("bucket lock poisoned").insert(pkt);
    }

    /// Folds queued packets into the persistent counts.
    pub fn apply(&self) {
        let drained: Vec<Packet> = {
            let mut queue = self.queue.lock().expect("bucket lock poisoned");
            queue.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("count state lock poisoned");
        for pkt in &drained {
            let len = |f: Field| match pkt.get(&f) {
                Some(Value::Int(n)) => *n as i64,
                _ => 0,
            };
            state.persistent_packets += 1;
            state.persistent_bytes += len(Field::HeaderLen) + len(Field::PayloadLen);
        }
        debug!(
            persistent_packets = state.persistent_packets,
            "count bucket absorbed queued packets"
        );
    }

    /// Marks the start of a classifier install touching this bucket.
    /// Counter events block until [`finish_update`](CountBucket::finish_update).
    pub fn start_update(&self) {
        let mut state = self.state.lock().expect("count state lock poisoned");
        state.in_update = true;
        state.stats_query = None;
        state.outstanding_switches.clear();
    }

    /// Marks the end of a classifier install and wakes waiters. The first
    /// update additionally pulls counters of rules that predate the bucket,
    /// seeding the existing-rule accounting before user traffic.
    pub fn finish_update(&self) {
        let (was_new, existing_query) = {
            let mut state = self.state.lock().expect("count state lock poisoned");
            state.in_update = false;
            let was_new = state.new_bucket;
            state.new_bucket = false;
            if was_new {
                // inline pull of pre-existing rule counters; same pull-start
                // state as pull_helper
                state.outstanding_switches.clear();
                state.packets = state.persistent_packets;
                state.bytes = state.persistent_bytes;
            }
            self.in_update_cv.notify_all();
            (was_new, state.existing_stats_query.clone())
        };
        info!(new_bucket = was_new, "count bucket update finished");
        if was_new {
            if let Some(query) = existing_query {
                query();
            }
        }
    }

    /// Points at the runtime function that issues flow-stats requests for
    /// the bucket's current rules.
    pub fn set_stats_query(&self, f: StatsQueryFn) {
        self.state.lock().expect("count state lock poisoned").stats_query = Some(f);
    }

    /// Points at the runtime function that issues flow-stats requests only
    /// for rules that already existed when the bucket was created.
    pub fn set_existing_stats_query(&self, f: StatsQueryFn) {
        self.state
            .lock()
            .expect("count state lock poisoned")
            .existing_stats_query = Some(f);
    }

    /// Associates an installed rule with this bucket. Keyed on the full
    /// (match, priority, version) tuple; duplicates are idempotent.
    /// `existing` marks rules that were already on switches when the bucket
    /// was created.
    pub fn add_match(&self, pattern: Match, priority: u16, version: u64, existing: bool) {
        let mut state = self.state.lock().expect("count state lock poisoned");
        let entry = MatchEntry {
            pattern,
            priority,
            version,
        };
        state.matches.entry(entry).or_insert(MatchStatus {
            to_be_deleted: false,
            existing_rule: existing,
        });
    }

    /// Marks a rule as pending removal. The entry survives until the switch
    /// confirms with a flow-removed message carrying final counters.
    pub fn delete_match(&self, pattern: Match, priority: u16, version: u64) {
        let mut state = self.state.lock().expect("count state lock poisoned");
        let entry = MatchEntry {
            pattern,
            priority,
            version,
        };
        if let Some(status) = state.matches.get_mut(&entry) {
            status.to_be_deleted = true;
        }
    }

    /// Handles a flow-removed message: folds the rule's lifetime counters
    /// into the persistent counts (unless the rule predated the bucket, in
    /// which case it is simply forgotten) and drops the entry.
    pub fn handle_flow_removed(
        &self,
        pattern: Match,
        priority: u16,
        version: u64,
        packet_count: i64,
        byte_count: i64,
    ) {
        let mut state = self
            .in_update_cv
            .wait_while(
                self.state.lock().expect("count state lock poisoned"),
                |s| s.in_update,
            )
            .expect("count state lock poisoned");
        let entry = MatchEntry {
            pattern,
            priority,
            version,
        };
        if let Some(status) = state.matches.get(&entry).copied() {
            assert!(
                status.to_be_deleted,
                "flow removed for a rule not marked for deletion"
            );
            if !status.existing_rule {
                debug!(packet_count, byte_count, "absorbing removed-rule counters");
                state.persistent_packets += packet_count;
                state.persistent_bytes += byte_count;
            }
            state.matches.remove(&entry);
        }
    }

    /// Registers a switch as owing a stats reply for the current pull.
    pub fn add_outstanding_switch(&self, switch: u64) {
        let mut state = self.state.lock().expect("count state lock poisoned");
        if !state.outstanding_switches.contains(&switch) {
            state.outstanding_switches.push(switch);
        }
    }

    fn pull_helper(
        &self,
        select: impl Fn(&CountState) -> Option<StatsQueryFn>,
    ) -> bool {
        let query = {
            let mut state = self
                .in_update_cv
                .wait_while(
                    self.state.lock().expect("count state lock poisoned"),
                    |s| s.in_update,
                )
                .expect("count state lock poisoned");
            // A pull in progress loses its intermediate results here; replies
            // arriving later are matched against versioned entries, so they
            // count against the generation that owns them.
            state.outstanding_switches.clear();
            state.packets = state.persistent_packets;
            state.bytes = state.persistent_bytes;
            select(&state)
        };
        match query {
            Some(f) => f(),
            None => false,
        }
    }

    /// Issues stats queries on the user's behalf. If no queries go out (no
    /// rules reference the bucket), the persistent totals are reported to
    /// the callbacks synchronously.
    pub fn pull_stats(&self) {
        let issued = self.pull_helper(|s| s.stats_query.clone());
        if !issued {
            let counts = {
                let mut state = self.state.lock().expect("count state lock poisoned");
                state.packets = state.persistent_packets;
                state.bytes = state.persistent_bytes;
                Counts {
                    packets: state.packets,
                    bytes: state.bytes,
                }
            };
            self.fire_callbacks(counts);
        }
    }

    /// Pulls counters only for rules that predate the bucket.
    pub fn pull_existing_stats(&self) {
        self.pull_helper(|s| s.existing_stats_query.clone());
    }

    /// Handles a flow-stats reply from `switch`: counts every entry whose
    /// (match, priority, cookie) the bucket tracks, subtracting the first
    /// reply of pre-existing rules so pre-bucket traffic is not counted.
    /// Purely additive on top of the totals the pull started from, so
    /// replies from different switches accumulate. When the last outstanding
    /// switch replies, callbacks fire exactly once with the totals.
    pub fn handle_flow_stats_reply(&self, switch: u64, stats: Vec<FlowStat>) {
        let totals = {
            let mut state = self
                .in_update_cv
                .wait_while(
                    self.state.lock().expect("count state lock poisoned"),
                    |s| s.in_update,
                )
                .expect("count state lock poisoned");
            let state = &mut *state;
            if let Some(pos) = state
                .outstanding_switches
                .iter()
                .position(|s| *s == switch)
            {
                for stat in &stats {
                    let mut pattern = stat.pattern.clone();
                    pattern.map.insert(Field::Switch, Value::Int(switch));
                    let entry = MatchEntry {
                        pattern,
                        priority: stat.priority,
                        version: stat.cookie,
                    };
                    if let Some(status) = state.matches.get_mut(&entry) {
                        if !status.existing_rule {
                            state.packets += stat.packet_count;
                            state.bytes += stat.byte_count;
                        } else {
                            debug!(
                                packet_count = stat.packet_count,
                                "discounting pre-existing rule counters"
                            );
                            status.existing_rule = false;
                            state.persistent_packets -= stat.packet_count;
                            state.persistent_bytes -= stat.byte_count;
                        }
                    }
                }
                state.outstanding_switches.remove(pos);
            }
            if state.outstanding_switches.is_empty() {
                Some(Counts {
                    packets: state.packets,
                    bytes: state.bytes,
                })
            } else {
                None
            }
        };
        if let Some(counts) = totals {
            info!(
                packets = counts.packets,
                bytes = counts.bytes,
                "count bucket pull complete"
            );
            self.fire_callbacks(counts);
        }
    }

    /// The rules currently associated with the bucket. Waits out any
    /// classifier update in progress.
    pub fn get_matches(&self) -> Vec<(MatchEntry, MatchStatus)> {
        let state = self
            .in_update_cv
            .wait_while(
                self.state.lock().expect("count state lock poisoned"),
                |s| s.in_update,
            )
            .expect("count state lock poisoned");
        state
            .matches
            .iter()
            .map(|(e, s)| (e.clone(), *s))
            .collect()
    }

    /// The last reported totals.
    pub fn counts(&self) -> Counts {
        let state = self.state.lock().expect("count state lock poisoned");
        Counts {
            packets: state.packets,
            bytes: state.bytes,
        }
    }

    fn fire_callbacks(&self, counts: Counts) {
        let callbacks = self.callbacks.lock().expect("callback lock poisoned").clone();
        for f in &callbacks {
            f(counts);
        }
    }
}

impl fmt::Debug for CountBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountBucket({:p})", self)
    }
}
