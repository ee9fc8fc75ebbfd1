use std::collections::HashSet;
use std::ops::{Add, Shr};
use std::sync::Arc;

use thiserror::Error;

use crate::bucket::{CountBucket, PathBucket};
use crate::packet::Packet;
use crate::pred::{Match, Pred};
use crate::types::{Field, FieldMap, Value};

#[derive(Error, Debug)]
/// Errors raised while composing classifiers.
pub enum CompileError {
    #[error("negation is defined only for filter classifiers, found action {0}")]
    NegateNonFilter(String),
}

#[derive(Clone, Debug)]
/// A reference to a measurement bucket, compared by identity.
pub enum BucketRef {
    Count(Arc<CountBucket>),
    Path(Arc<PathBucket>),
}

impl PartialEq for BucketRef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BucketRef::Count(a), BucketRef::Count(b)) => Arc::ptr_eq(a, b),
            (BucketRef::Path(a), BucketRef::Path(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
/// A single action of a classifier rule. Each action in a rule's list
/// independently produces packets; the rule's output is their union.
pub enum Action {
    /// Pass the packet unchanged.
    Identity,
    /// Discard the packet.
    Drop,
    /// Send the packet to the controller.
    Controller,
    /// Rewrite the listed fields.
    Modify(FieldMap),
    /// Deliver a copy to a measurement bucket.
    Bucket(BucketRef),
}

impl Action {
    fn describe(&self) -> String {
        match self {
            Action::Identity => "identity".to_string(),
            Action::Drop => "drop".to_string(),
            Action::Controller => "controller".to_string(),
            Action::Modify(_) => "modify".to_string(),
            Action::Bucket(_) => "bucket".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
/// A prioritized match/action-list rule.
pub struct Rule {
    pub pattern: Match,
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn new(pattern: Match, actions: Vec<Action>) -> Rule {
        Rule {
            pattern,
            actions: normalize_actions(actions),
        }
    }
}

/// Deduplicate an action list and remove `Drop`s made redundant by other
/// actions. An empty list normalizes to a single `Drop`.
fn normalize_actions(actions: Vec<Action>) -> Vec<Action> {
    let mut out: Vec<Action> = Vec::new();
    for a in actions {
        if !out.contains(&a) {
            out.push(a);
        }
    }
    if out.len() > 1 {
        out.retain(|a| *a != Action::Drop);
    }
    if out.is_empty() {
        out.push(Action::Drop);
    }
    out
}

#[derive(Clone, Debug, Default, PartialEq)]
/// An ordered rule list under first-match semantics; earlier rules win.
///
/// Every classifier produced by compilation is *total*: some rule matches
/// every packet, because a `match-anything` rule terminates the list.
pub struct Classifier {
    pub rules: Vec<Rule>,
}

impl Classifier {
    pub fn new(rules: Vec<Rule>) -> Classifier {
        Classifier { rules }
    }

    /// The classifier that passes everything.
    pub fn pass_all() -> Classifier {
        Classifier::new(vec![Rule::new(Match::any(), vec![Action::Identity])])
    }

    /// The classifier that drops everything.
    pub fn drop_all() -> Classifier {
        Classifier::new(vec![Rule::new(Match::any(), vec![Action::Drop])])
    }

    /// The first rule matching the packet.
    pub fn lookup(&self, pkt: &Packet) -> Option<&Rule> {
        self.rules.iter().find(|r| r.pattern.matches(pkt))
    }

    /// Applies the selected rule's actions to the packet. Controller and
    /// bucket actions deliver a copy out of band and contribute no packets
    /// to the result, exactly as policy evaluation does.
    pub fn eval(&self, pkt: &Packet) -> HashSet<Packet> {
        let mut out = HashSet::new();
        if let Some(rule) = self.lookup(pkt) {
            for action in &rule.actions {
                match action {
                    Action::Identity => {
                        out.insert(pkt.clone());
                    }
                    Action::Drop | Action::Controller => {}
                    Action::Modify(m) => {
                        out.insert(pkt.modify_many(m));
                    }
                    Action::Bucket(BucketRef::Count(b)) => b.capture(pkt.clone()),
                    Action::Bucket(BucketRef::Path(b)) => b.capture(pkt.clone()),
                }
            }
        }
        out
    }

    /// Swaps `Identity` and `Drop` action-wise. Defined only for classifiers
    /// arising from filters; any other action is an error rather than being
    /// silently dropped.
    pub fn negate(&self) -> Result<Classifier, CompileError> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for r in &self.rules {
            let action = match r.actions.as_slice() {
                [Action::Identity] => Action::Drop,
                [Action::Drop] => Action::Identity,
                [other, ..] => return Err(CompileError::NegateNonFilter(other.describe())),
                [] => return Err(CompileError::NegateNonFilter("empty".to_string())),
            };
            rules.push(Rule::new(r.pattern.clone(), vec![action]));
        }
        Ok(Classifier::new(rules))
    }

    /// Removes rules unreachable under first-match semantics: any rule whose
    /// match is covered by an earlier rule's match can never be selected.
    pub fn optimize(self) -> Classifier {
        let mut kept: Vec<Rule> = Vec::with_capacity(self.rules.len());
        for rule in self.rules {
            if kept.iter().any(|k| k.pattern.covers(&rule.pattern)) {
                continue;
            }
            kept.push(rule);
        }
        Classifier::new(kept)
    }

    /// The set of packets with no forwarding action, as a filter. A
    /// forwarding action is any modify that writes `outport`; controller and
    /// bucket deliveries do not count as forwarding.
    pub fn dropped(&self) -> Pred {
        let mut forwarded: Vec<Pred> = Vec::new();
        for r in &self.rules {
            let forwards = r.actions.iter().any(|a| match a {
                Action::Modify(m) => m.contains_key(&Field::Outport),
                _ => false,
            });
            if forwards {
                forwarded.push(Pred::Match(r.pattern.clone()));
            }
        }
        !Pred::union(forwarded)
    }
}

/// Restrict `c` to the packets produced by `Modify(mods)`: constraints
/// guaranteed by the rewrite are discharged, conflicting rules disappear, and
/// the rewrite is composed onto each surviving action list.
fn push_modify(mods: &FieldMap, c: &Classifier) -> Classifier {
    let mut rules = Vec::new();
    'rule: for r in &c.rules {
        let mut residual = FieldMap::new();
        for (field, pattern) in &r.pattern.map {
            match mods.get(field) {
                Some(written) => {
                    if !written_satisfies(field, pattern, written) {
                        continue 'rule;
                    }
                }
                None => {
                    residual.insert(field.clone(), pattern.clone());
                }
            }
        }
        let actions = r
            .actions
            .iter()
            .map(|a| compose_modify(mods, a))
            .collect::<Vec<_>>();
        rules.push(Rule::new(Match::from_map(residual), actions));
    }
    Classifier::new(rules)
}

/// Whether the concrete value written by a modify satisfies a rule pattern.
fn written_satisfies(field: &Field, pattern: &Value, written: &Value) -> bool {
    match (pattern, written) {
        (Value::None, Value::None) => true,
        (Value::None, _) => false,
        (_, Value::None) => false,
        (Value::Ip(p), Value::Ip(w)) if field.is_cidr() => p.contains(w),
        (p, w) => p == w,
    }
}

/// Sequential composition of a modify with a downstream action.
fn compose_modify(mods: &FieldMap, action: &Action) -> Action {
    match action {
        Action::Identity => Action::Modify(mods.clone()),
        Action::Drop => Action::Drop,
        Action::Modify(later) => {
            let mut merged = mods.clone();
            for (f, v) in later {
                merged.insert(f.clone(), v.clone());
            }
            Action::Modify(merged)
        }
        Action::Controller => Action::Controller,
        Action::Bucket(b) => Action::Bucket(b.clone()),
    }
}

impl Add for Classifier {
    type Output = Classifier;

    /// Parallel composition: the ordered cartesian product of the rule
    /// lists. Each pair's match is the meet of the two matches (pairs with an
    /// empty meet are eliminated) and its action list is the concatenation of
    /// the two, deduplicated.
    fn add(self, rhs: Classifier) -> Classifier {
        let mut rules = Vec::new();
        for r1 in &self.rules {
            for r2 in &rhs.rules {
                if let Some(met) = r1.pattern.intersect(&r2.pattern) {
                    let mut actions = r1.actions.clone();
                    actions.extend(r2.actions.iter().cloned());
                    rules.push(Rule::new(met, actions));
                }
            }
        }
        Classifier::new(rules)
    }
}

impl Shr for Classifier {
    type Output = Classifier;

    /// Sequential composition: each rule of the left classifier is pushed
    /// through the right one action by action. `Identity` passes the right
    /// classifier through, `Drop` cuts it off, a modify restricts it, and
    /// controller/bucket actions are terminal. The per-action effects are
    /// combined in parallel (a rule's actions union their outputs) and met
    /// with the rule's own match.
    fn shr(self, rhs: Classifier) -> Classifier {
        let mut rules = Vec::new();
        for r in &self.rules {
            let mut effect: Option<Classifier> = None;
            for action in &r.actions {
                let sub = match action {
                    Action::Identity => rhs.clone(),
                    Action::Drop => Classifier::drop_all(),
                    Action::Modify(m) => push_modify(m, &rhs),
                    Action::Controller => Classifier::new(vec![Rule::new(
                        Match::any(),
                        vec![Action::Controller],
                    )]),
                    Action::Bucket(b) => Classifier::new(vec![Rule::new(
                        Match::any(),
                        vec![Action::Bucket(b.clone())],
                    )]),
                };
                effect = Some(match effect {
                    None => sub,
                    Some(acc) => acc + sub,
                });
            }
            let effect = effect.unwrap_or_else(Classifier::drop_all);
            for s in &effect.rules {
                if let Some(met) = r.pattern.intersect(&s.pattern) {
                    rules.push(Rule::new(met, s.actions.clone()));
                }
            }
        }
        Classifier::new(rules)
    }
}
