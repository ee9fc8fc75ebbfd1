use std::collections::HashSet;
use std::fmt;
use std::ops::{Add, Shr};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::bucket::{CountBucket, FwdBucket, PathBucket};
use crate::classifier::{Action, BucketRef, Classifier, CompileError, Rule};
use crate::packet::Packet;
use crate::pred::{Match, Pred};
use crate::types::{Field, FieldMap, Value};

#[derive(Clone, Debug)]
/// A network policy: a function from a located packet to a set of located
/// packets, built algebraically from filters, rewrites and combinators.
pub enum Policy {
    /// A filter embedded as a policy: identity on matching packets, drop on
    /// the rest.
    Filter(Pred),
    /// Rewrite the listed fields.
    Modify(FieldMap),
    /// Send the packet to the controller. A routing sink, not a function:
    /// it produces no packets in-process.
    Controller,
    /// Union of policies; the empty combinator behaves as drop.
    Parallel(Vec<Policy>),
    /// Relational composition; the empty combinator behaves as identity.
    Sequential(Vec<Policy>),
    /// Branch on a filter.
    If(Box<IfPolicy>),
    /// Forward out the given port.
    Fwd(u64),
    /// Forward out the given port unless the packet arrived on it.
    XFwd(u64),
    /// A policy whose inner policy may be replaced at runtime.
    Dynamic(DynamicPolicy),
    /// Deliver packets to the controller for per-packet callbacks.
    FwdBucket(Arc<FwdBucket>),
    /// Deliver packets together with their network trajectories.
    PathBucket(Arc<PathBucket>),
    /// Count packets via switch flow counters.
    CountBucket(Arc<CountBucket>),
}

#[derive(Clone, Debug)]
/// The three-way branch of [`Policy::If`].
pub struct IfPolicy {
    pub pred: Pred,
    pub then_pol: Policy,
    pub else_pol: Policy,
}

impl Policy {
    /// The identity policy: passes every packet unchanged.
    pub fn identity() -> Policy {
        Policy::Filter(Pred::Identity)
    }

    /// The drop policy: produces no packets.
    pub fn drop() -> Policy {
        Policy::Filter(Pred::Drop)
    }

    /// Filter on the given field patterns.
    pub fn matching(map: FieldMap) -> Policy {
        Policy::Filter(Pred::matching(map))
    }

    /// Parallel composition of several policies; empty is drop.
    pub fn parallel(policies: Vec<Policy>) -> Policy {
        match policies.len() {
            0 => Policy::drop(),
            1 => policies.into_iter().next().expect("length checked"),
            _ => Policy::Parallel(policies),
        }
    }

    /// Sequential composition of several policies; empty is identity.
    pub fn sequential(policies: Vec<Policy>) -> Policy {
        match policies.len() {
            0 => Policy::identity(),
            1 => policies.into_iter().next().expect("length checked"),
            _ => Policy::Sequential(policies),
        }
    }

    /// `if pred { then_pol } else { else_pol }`.
    pub fn if_else(pred: Pred, then_pol: Policy, else_pol: Policy) -> Policy {
        Policy::If(Box::new(IfPolicy {
            pred,
            then_pol,
            else_pol,
        }))
    }

    /// Single-packet evaluation.
    pub fn eval(&self, pkt: &Packet) -> HashSet<Packet> {
        let mut out = HashSet::new();
        match self {
            Policy::Filter(p) => {
                if p.eval(pkt) {
                    out.insert(pkt.clone());
                }
            }
            Policy::Modify(m) => {
                out.insert(pkt.modify_many(m));
            }
            Policy::Controller => {}
            Policy::Parallel(ps) => {
                for p in ps {
                    out.extend(p.eval(pkt));
                }
            }
            Policy::Sequential(ps) => {
                let mut current: HashSet<Packet> = HashSet::from([pkt.clone()]);
                for p in ps {
                    if current.is_empty() {
                        break;
                    }
                    let mut next = HashSet::new();
                    for q in &current {
                        next.extend(p.eval(q));
                    }
                    current = next;
                }
                return current;
            }
            Policy::If(branch) => {
                return if branch.pred.eval(pkt) {
                    branch.then_pol.eval(pkt)
                } else {
                    branch.else_pol.eval(pkt)
                };
            }
            Policy::Fwd(port) => {
                out.insert(pkt.modify_many(&fwd_map(*port)));
            }
            Policy::XFwd(port) => {
                if pkt.get(&Field::Inport) != Some(&Value::Int(*port)) {
                    out.insert(pkt.modify_many(&fwd_map(*port)));
                }
            }
            Policy::Dynamic(d) => return d.policy().eval(pkt),
            Policy::FwdBucket(b) => b.capture(pkt.clone()),
            Policy::PathBucket(b) => b.capture(pkt.clone()),
            Policy::CountBucket(b) => b.capture(pkt.clone()),
        }
        out
    }

    /// Compiles the policy tree to a total classifier by recursing and
    /// applying the classifier algebra. Dynamic nodes cache their compiled
    /// classifier until their policy is replaced.
    pub fn compile(&self) -> Result<Classifier, CompileError> {
        match self {
            Policy::Filter(p) => p.compile(),
            Policy::Modify(m) => Ok(Classifier::new(vec![Rule::new(
                Match::any(),
                vec![Action::Modify(m.clone())],
            )])),
            Policy::Controller => Ok(Classifier::new(vec![Rule::new(
                Match::any(),
                vec![Action::Controller],
            )])),
            Policy::Parallel(ps) => {
                let mut acc = Classifier::drop_all();
                for p in ps {
                    acc = acc + p.compile()?;
                }
                Ok(acc)
            }
            Policy::Sequential(ps) => {
                let mut acc = Classifier::pass_all();
                for p in ps {
                    acc = acc >> p.compile()?;
                }
                Ok(acc)
            }
            Policy::If(branch) => {
                let desugared = (Policy::Filter(branch.pred.clone()) >> branch.then_pol.clone())
                    + (Policy::Filter(!branch.pred.clone()) >> branch.else_pol.clone());
                desugared.compile()
            }
            Policy::Fwd(port) => Policy::Modify(fwd_map(*port)).compile(),
            Policy::XFwd(port) => {
                let not_in = !Pred::matching(FieldMap::from([(
                    Field::Inport,
                    Value::Int(*port),
                )]));
                (Policy::Filter(not_in) >> Policy::Fwd(*port)).compile()
            }
            Policy::Dynamic(d) => d.compile(),
            Policy::FwdBucket(_) => Ok(Classifier::new(vec![Rule::new(
                Match::any(),
                vec![Action::Controller],
            )])),
            Policy::PathBucket(b) => Ok(Classifier::new(vec![Rule::new(
                Match::any(),
                vec![Action::Bucket(BucketRef::Path(b.clone()))],
            )])),
            Policy::CountBucket(b) => Ok(Classifier::new(vec![Rule::new(
                Match::any(),
                vec![Action::Bucket(BucketRef::Count(b.clone()))],
            )])),
        }
    }

    /// Registers a change callback on every dynamic node in the tree, so a
    /// runtime learns when its installed classifier went stale.
    pub fn subscribe(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.for_each_dynamic(&mut |d| {
            d.inner
                .listeners
                .lock()
                .expect("listener lock poisoned")
                .push(Listener::Subscriber(callback.clone()));
        });
    }

    fn for_each_dynamic(&self, f: &mut impl FnMut(&DynamicPolicy)) {
        match self {
            Policy::Parallel(ps) | Policy::Sequential(ps) => {
                for p in ps {
                    p.for_each_dynamic(f);
                }
            }
            Policy::If(branch) => {
                branch.then_pol.for_each_dynamic(f);
                branch.else_pol.for_each_dynamic(f);
            }
            Policy::Dynamic(d) => f(d),
            _ => {}
        }
    }
}

fn fwd_map(port: u64) -> FieldMap {
    FieldMap::from([(Field::Outport, Value::Int(port))])
}

impl Add for Policy {
    type Output = Policy;

    /// The parallel composition operator.
    fn add(self, rhs: Policy) -> Policy {
        match (self, rhs) {
            (Policy::Parallel(mut a), Policy::Parallel(b)) => {
                a.extend(b);
                Policy::Parallel(a)
            }
            (Policy::Parallel(mut a), b) => {
                a.push(b);
                Policy::Parallel(a)
            }
            (a, b) => Policy::Parallel(vec![a, b]),
        }
    }
}

impl Shr for Policy {
    type Output = Policy;

    /// The sequential composition operator.
    fn shr(self, rhs: Policy) -> Policy {
        match (self, rhs) {
            (Policy::Sequential(mut a), Policy::Sequential(b)) => {
                a.extend(b);
                Policy::Sequential(a)
            }
            (Policy::Sequential(mut a), b) => {
                a.push(b);
                Policy::Sequential(a)
            }
            (a, b) => Policy::Sequential(vec![a, b]),
        }
    }
}

/// A listener edge out of a dynamic node. Parents are held weakly so a
/// replaced subtree cannot keep its old ancestors alive.
enum Listener {
    Parent(Weak<DynamicInner>),
    Subscriber(Arc<dyn Fn() + Send + Sync>),
}

struct DynamicState {
    policy: Policy,
    classifier: Option<Classifier>,
}

struct DynamicInner {
    state: Mutex<DynamicState>,
    listeners: Mutex<Vec<Listener>>,
}

#[derive(Clone)]
/// A policy whose inner policy may be replaced at runtime.
///
/// Replacing the policy clears this node's cached classifier and fires a
/// change notification up through the listener edges, so every dynamic
/// ancestor drops its cache and external subscribers recompile.
pub struct DynamicPolicy {
    inner: Arc<DynamicInner>,
}

impl DynamicPolicy {
    /// Creates a dynamic node with the given initial policy (drop if you
    /// have none yet).
    pub fn new(policy: Policy) -> DynamicPolicy {
        let node = DynamicPolicy {
            inner: Arc::new(DynamicInner {
                state: Mutex::new(DynamicState {
                    policy: Policy::drop(),
                    classifier: None,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        };
        node.adopt(policy);
        node
    }

    /// The current inner policy.
    pub fn policy(&self) -> Policy {
        self.inner
            .state
            .lock()
            .expect("dynamic policy lock poisoned")
            .policy
            .clone()
    }

    /// Replaces the inner policy and notifies listeners.
    pub fn set_policy(&self, policy: Policy) {
        self.adopt(policy);
        debug!("dynamic policy replaced, invalidating ancestors");
        self.notify();
    }

    /// Installs `policy` as the inner policy and registers this node as a
    /// parent listener on every dynamic node inside it, so descendant
    /// replacements invalidate this node's cache too.
    fn adopt(&self, policy: Policy) {
        policy.for_each_dynamic(&mut |child| {
            child
                .inner
                .listeners
                .lock()
                .expect("listener lock poisoned")
                .push(Listener::Parent(Arc::downgrade(&self.inner)));
        });
        let mut state = self.inner.state.lock().expect("dynamic policy lock poisoned");
        state.policy = policy;
        state.classifier = None;
    }

    fn notify(&self) {
        let listeners = self.inner.listeners.lock().expect("listener lock poisoned");
        for l in listeners.iter() {
            match l {
                Listener::Parent(weak) => {
                    if let Some(parent) = weak.upgrade() {
                        parent
                            .state
                            .lock()
                            .expect("dynamic policy lock poisoned")
                            .classifier = None;
                        DynamicPolicy { inner: parent }.notify();
                    }
                }
                Listener::Subscriber(f) => f(),
            }
        }
    }

    /// Compiles the current inner policy, caching the result until the next
    /// replacement.
    pub fn compile(&self) -> Result<Classifier, CompileError> {
        let cached = {
            let state = self.inner.state.lock().expect("dynamic policy lock poisoned");
            state.classifier.clone()
        };
        if let Some(c) = cached {
            return Ok(c);
        }
        let policy = self.policy();
        let compiled = policy.compile()?;
        let mut state = self.inner.state.lock().expect("dynamic policy lock poisoned");
        state.classifier = Some(compiled.clone());
        Ok(compiled)
    }
}

impl fmt::Debug for DynamicPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.state.try_lock() {
            Ok(state) => write!(f, "DynamicPolicy({:?})", state.policy),
            Err(_) => f.write_str("DynamicPolicy(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::types::field_map;

    #[test]
    fn xfwd_suppresses_hairpin() {
        let p = Policy::XFwd(2);
        let arrived_elsewhere = Packet::new().with(Field::Inport, 1u64);
        let arrived_there = Packet::new().with(Field::Inport, 2u64);
        assert_eq!(p.eval(&arrived_elsewhere).len(), 1);
        assert!(p.eval(&arrived_there).is_empty());
    }

    #[test]
    fn dynamic_replacement_invalidates_ancestors() {
        let leaf = DynamicPolicy::new(Policy::drop());
        let parent = DynamicPolicy::new(Policy::Dynamic(leaf.clone()) + Policy::Fwd(1));

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        Policy::Dynamic(parent.clone()).subscribe(Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        let before = parent.compile().unwrap();
        leaf.set_policy(Policy::matching(field_map(vec![("switch", 1u64)])));
        let after = parent.compile().unwrap();

        assert_ne!(before, after);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
