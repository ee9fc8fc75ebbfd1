use std::ops::{BitAnd, BitOr, Not, Sub};

use serde::{Deserialize, Serialize};

use crate::classifier::{Action, Classifier, CompileError, Rule};
use crate::packet::Packet;
use crate::types::{Field, FieldMap, Value};

#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// A match predicate: a finite map from fields to patterns.
///
/// A packet matches iff every listed field is present and matches its
/// pattern. The empty match matches everything. `srcip`/`dstip` patterns are
/// CIDR prefixes compared by containment; every other field compares by
/// equality. A [`Value::None`] pattern requires the field to be absent.
pub struct Match {
    pub map: FieldMap,
}

/// Whether a concrete packet value satisfies a pattern for the given field.
fn value_matches(field: &Field, pattern: &Value, value: &Value) -> bool {
    match (pattern, value) {
        (Value::None, _) => false, // pattern requires absence; field is present
        (Value::Ip(p), Value::Ip(v)) if field.is_cidr() => p.contains(v),
        (p, v) => p == v,
    }
}

impl Match {
    /// The empty match, which matches every packet.
    pub fn any() -> Match {
        Match::default()
    }

    pub fn from_map(map: FieldMap) -> Match {
        Match { map }
    }

    /// Whether this is the empty (match-everything) predicate.
    pub fn is_any(&self) -> bool {
        self.map.is_empty()
    }

    /// Single-packet evaluation.
    pub fn matches(&self, pkt: &Packet) -> bool {
        self.map.iter().all(|(field, pattern)| match pkt.get(field) {
            Some(value) => value_matches(field, pattern, value),
            None => *pattern == Value::None,
        })
    }

    /// The meet of two matches, or `None` when no packet satisfies both.
    ///
    /// Shared equality fields must coincide; shared CIDR fields keep the more
    /// specific prefix when one contains the other.
    pub fn intersect(&self, other: &Match) -> Option<Match> {
        let mut map = self.map.clone();
        for (field, pattern) in &other.map {
            match map.get(field) {
                None => {
                    map.insert(field.clone(), pattern.clone());
                }
                Some(existing) if existing == pattern => {}
                Some(Value::Ip(a)) if field.is_cidr() => {
                    let b = match pattern {
                        Value::Ip(b) => b,
                        _ => return None,
                    };
                    let narrower = if a.contains(b) {
                        *b
                    } else if b.contains(a) {
                        *a
                    } else {
                        return None;
                    };
                    map.insert(field.clone(), Value::Ip(narrower));
                }
                Some(_) => return None,
            }
        }
        Some(Match { map })
    }

    /// True iff every packet matched by `other` is matched by `self`.
    pub fn covers(&self, other: &Match) -> bool {
        self.map.iter().all(|(field, pattern)| {
            match other.map.get(field) {
                None => false, // other is less specific on this field
                Some(Value::Ip(b)) if field.is_cidr() => match pattern {
                    Value::Ip(a) => a.contains(b),
                    _ => false,
                },
                Some(v) => pattern == v,
            }
        })
    }
}

impl FromIterator<(Field, Value)> for Match {
    fn from_iter<I: IntoIterator<Item = (Field, Value)>>(iter: I) -> Match {
        Match {
            map: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
/// A filter policy: passes matching packets unchanged and drops the rest.
///
/// Filters form a Boolean algebra under `|` (union), `&` (intersection),
/// `!` (negation) and `-` (difference). They embed into [`Policy`] via
/// [`Policy::Filter`]; negation and the Boolean forms exist only here, so a
/// non-filter operand is unrepresentable rather than a runtime error.
///
/// [`Policy`]: crate::policy::Policy
/// [`Policy::Filter`]: crate::policy::Policy::Filter
pub enum Pred {
    /// Matches every packet.
    Identity,
    /// Matches no packet.
    Drop,
    /// Match on header fields.
    Match(Match),
    /// Union of filters; empty union is `Drop`.
    Union(Vec<Pred>),
    /// Intersection of filters; empty intersection is `Identity`.
    Intersection(Vec<Pred>),
    /// Complement of a filter.
    Negate(Box<Pred>),
}

impl Pred {
    /// Filter on the given field patterns.
    pub fn matching(map: FieldMap) -> Pred {
        Pred::Match(Match::from_map(map))
    }

    /// Union of filters. `union([])` is [`Pred::Drop`].
    pub fn union(preds: Vec<Pred>) -> Pred {
        match preds.len() {
            0 => Pred::Drop,
            1 => preds.into_iter().next().expect("length checked"),
            _ => Pred::Union(preds),
        }
    }

    /// Intersection of filters. `intersection([])` is [`Pred::Identity`].
    pub fn intersection(preds: Vec<Pred>) -> Pred {
        match preds.len() {
            0 => Pred::Identity,
            1 => preds.into_iter().next().expect("length checked"),
            _ => Pred::Intersection(preds),
        }
    }

    /// Packets in `a` but not in `b`.
    pub fn difference(a: Pred, b: Pred) -> Pred {
        !b & a
    }

    /// Single-packet evaluation.
    pub fn eval(&self, pkt: &Packet) -> bool {
        match self {
            Pred::Identity => true,
            Pred::Drop => false,
            Pred::Match(m) => m.matches(pkt),
            Pred::Union(ps) => ps.iter().any(|p| p.eval(pkt)),
            Pred::Intersection(ps) => ps.iter().all(|p| p.eval(pkt)),
            Pred::Negate(p) => !p.eval(pkt),
        }
    }

    /// Compiles the filter to a total classifier whose actions are drawn
    /// from `{Identity, Drop}` only.
    pub fn compile(&self) -> Result<Classifier, CompileError> {
        match self {
            Pred::Identity => Ok(Classifier::pass_all()),
            Pred::Drop => Ok(Classifier::drop_all()),
            Pred::Match(m) => Ok(Classifier::new(vec![
                Rule::new(m.clone(), vec![Action::Identity]),
                Rule::new(Match::any(), vec![Action::Drop]),
            ])),
            Pred::Union(ps) => {
                let mut acc = Classifier::drop_all();
                for p in ps {
                    acc = acc + p.compile()?;
                }
                Ok(acc)
            }
            Pred::Intersection(ps) => {
                let mut acc = Classifier::pass_all();
                for p in ps {
                    acc = acc >> p.compile()?;
                }
                Ok(acc)
            }
            Pred::Negate(p) => p.compile()?.negate(),
        }
    }

    /// Whether the two filters pass a common packet. Decided by compiling
    /// their intersection and looking for a passing rule.
    pub fn overlaps(&self, other: &Pred) -> Result<bool, CompileError> {
        let classifier = (self.clone() & other.clone()).compile()?;
        Ok(classifier
            .rules
            .iter()
            .any(|r| r.actions.contains(&Action::Identity)))
    }

    /// Whether the filter passes no packet at all.
    pub fn is_empty(&self) -> Result<bool, CompileError> {
        Ok(!self.overlaps(&Pred::Identity)?)
    }
}

impl BitOr for Pred {
    type Output = Pred;

    fn bitor(self, rhs: Pred) -> Pred {
        match (self, rhs) {
            (Pred::Union(mut a), Pred::Union(b)) => {
                a.extend(b);
                Pred::Union(a)
            }
            (Pred::Union(mut a), b) => {
                a.push(b);
                Pred::Union(a)
            }
            (a, b) => Pred::Union(vec![a, b]),
        }
    }
}

impl BitAnd for Pred {
    type Output = Pred;

    fn bitand(self, rhs: Pred) -> Pred {
        match (self, rhs) {
            // two matches meet directly
            (Pred::Match(a), Pred::Match(b)) => match a.intersect(&b) {
                Some(m) => Pred::Match(m),
                None => Pred::Drop,
            },
            (Pred::Intersection(mut a), Pred::Intersection(b)) => {
                a.extend(b);
                Pred::Intersection(a)
            }
            (Pred::Intersection(mut a), b) => {
                a.push(b);
                Pred::Intersection(a)
            }
            (a, b) => Pred::Intersection(vec![a, b]),
        }
    }
}

impl Not for Pred {
    type Output = Pred;

    fn not(self) -> Pred {
        Pred::Negate(Box::new(self))
    }
}

impl Sub for Pred {
    type Output = Pred;

    fn sub(self, rhs: Pred) -> Pred {
        Pred::difference(self, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::field_map;

    fn m(pairs: Vec<(&'static str, Value)>) -> Match {
        Match::from_map(field_map(pairs))
    }

    #[test]
    fn empty_match_matches_everything() {
        let pkt = Packet::new().with(Field::Switch, 7u64);
        assert!(Match::any().matches(&pkt));
        assert!(Match::any().matches(&Packet::new()));
    }

    #[test]
    fn cidr_meet_keeps_more_specific() {
        let a = m(vec![("srcip", Value::from("10.0.0.0/8"))]);
        let b = m(vec![("srcip", Value::from("10.1.0.0/16"))]);
        let met = a.intersect(&b).unwrap();
        assert_eq!(met, m(vec![("srcip", Value::from("10.1.0.0/16"))]));
    }

    #[test]
    fn disjoint_equality_meet_is_empty() {
        let a = m(vec![("dstport", Value::Int(80))]);
        let b = m(vec![("dstport", Value::Int(443))]);
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn cidr_covers_is_containment() {
        let wide = m(vec![("srcip", Value::from("10.0.0.0/8"))]);
        let narrow = m(vec![("srcip", Value::from("10.0.0.0/24"))]);
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
    }

    #[test]
    fn none_pattern_requires_absence() {
        let untagged = m(vec![("vlan_id", Value::None)]);
        assert!(untagged.matches(&Packet::new()));
        assert!(!untagged.matches(&Packet::new().with(Field::VlanId, 5u64)));
    }
}
