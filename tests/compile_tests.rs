use netpol::classifier::{Action, Classifier};
use netpol::packet::Packet;
use netpol::policy::{DynamicPolicy, Policy};
use netpol::pred::{Match, Pred};
use netpol::types::{field_map, Field, Value};

fn pred(pairs: Vec<(&'static str, Value)>) -> Pred {
    Pred::matching(field_map(pairs))
}

fn policy(pairs: Vec<(&'static str, Value)>) -> Policy {
    Policy::matching(field_map(pairs))
}

/// A small grid of packets exercising every field the test policies touch.
fn packet_corpus() -> Vec<Packet> {
    let mut corpus = Vec::new();
    for switch in [1u64, 2, 3] {
        for dstport in [80u64, 443] {
            for srcip in ["10.0.0.5", "10.1.2.3", "192.168.0.1"] {
                corpus.push(
                    Packet::new()
                        .with(Field::Switch, switch)
                        .with(Field::Inport, 2u64)
                        .with(Field::Dstport, dstport)
                        .with(Field::Srcip, Value::from(srcip)),
                );
            }
        }
    }
    corpus.push(Packet::new());
    corpus
}

/// Compile soundness: the compiled classifier agrees with direct policy
/// evaluation on every packet.
fn assert_sound(p: &Policy) {
    let classifier = p.compile().expect("policy compiles");
    for pkt in packet_corpus() {
        assert_eq!(
            p.eval(&pkt),
            classifier.eval(&pkt),
            "policy {p:?} disagrees with its classifier on {pkt:?}"
        );
    }
}

#[test]
fn test_compile_soundness_corpus() {
    let web = policy(vec![("dstport", Value::Int(80))]);
    let sw1 = policy(vec![("switch", Value::Int(1))]);
    let subnet = policy(vec![("srcip", Value::from("10.0.0.0/8"))]);
    let corpus: Vec<Policy> = vec![
        Policy::identity(),
        Policy::drop(),
        Policy::Controller,
        web.clone(),
        subnet.clone(),
        Policy::Fwd(2),
        Policy::XFwd(2),
        web.clone() + sw1.clone(),
        web.clone() >> Policy::Fwd(2),
        (sw1.clone() >> Policy::Fwd(2)) + (web.clone() >> Policy::Controller),
        Policy::Filter(!pred(vec![("dstport", Value::Int(80))])),
        Policy::if_else(
            pred(vec![("switch", Value::Int(1))]),
            Policy::Fwd(2),
            Policy::drop(),
        ),
        subnet >> Policy::Modify(field_map(vec![("dstport", Value::Int(8080))])) >> web.clone(),
        Policy::sequential(vec![]),
        Policy::parallel(vec![]),
    ];
    for p in &corpus {
        assert_sound(p);
    }
}

#[test]
fn test_parallel_algebra() {
    let p = policy(vec![("dstport", Value::Int(80))]) >> Policy::Fwd(2);
    let q = policy(vec![("switch", Value::Int(1))]) >> Policy::Fwd(3);
    let joint = p.clone() + q.clone();
    let cp = p.compile().unwrap();
    let cq = q.compile().unwrap();
    let cjoint = joint.compile().unwrap();
    for pkt in packet_corpus() {
        let mut expected = p.eval(&pkt);
        expected.extend(q.eval(&pkt));
        assert_eq!(joint.eval(&pkt), expected);
        // C(p+q) ≡ C(p)+C(q) up to rule ordering artifacts: same packet sets
        assert_eq!(cjoint.eval(&pkt), (cp.clone() + cq.clone()).eval(&pkt));
    }
}

#[test]
fn test_sequential_algebra() {
    let p = policy(vec![("switch", Value::Int(1))]) >> Policy::Fwd(2);
    let q = policy(vec![("outport", Value::Int(2))])
        >> Policy::Modify(field_map(vec![("tos", Value::Int(7))]));
    let joint = p.clone() >> q.clone();
    for pkt in packet_corpus() {
        let mut expected = std::collections::HashSet::new();
        for mid in p.eval(&pkt) {
            expected.extend(q.eval(&mid));
        }
        assert_eq!(joint.eval(&pkt), expected);
    }
    assert_sound(&joint);
}

#[test]
fn test_filter_laws() {
    let f = pred(vec![("dstport", Value::Int(80))]);
    let laws: Vec<(Pred, Pred)> = vec![
        (f.clone() & f.clone(), f.clone()),
        (f.clone() | f.clone(), f.clone()),
        (!!f.clone(), f.clone()),
        (f.clone() & !f.clone(), Pred::Drop),
        (f.clone() | !f.clone(), Pred::Identity),
    ];
    for (lhs, rhs) in laws {
        for pkt in packet_corpus() {
            assert_eq!(
                lhs.eval(&pkt),
                rhs.eval(&pkt),
                "{lhs:?} and {rhs:?} disagree on {pkt:?}"
            );
        }
        // also at the classifier level
        let cl = lhs.compile().unwrap();
        let cr = rhs.compile().unwrap();
        for pkt in packet_corpus() {
            assert_eq!(cl.eval(&pkt), cr.eval(&pkt));
        }
    }
    assert!((f.clone() & !f).is_empty().unwrap());
}

#[test]
fn test_match_meet_agrees_with_conjunction() {
    let m1 = Match::from_map(field_map(vec![
        ("srcip", Value::from("10.0.0.0/8")),
        ("dstport", Value::Int(80)),
    ]));
    let m2 = Match::from_map(field_map(vec![("srcip", Value::from("10.1.0.0/16"))]));
    let met = m1.intersect(&m2).expect("meets are non-empty");
    assert_eq!(
        met,
        Match::from_map(field_map(vec![
            ("srcip", Value::from("10.1.0.0/16")),
            ("dstport", Value::Int(80)),
        ]))
    );
    for pkt in packet_corpus() {
        assert_eq!(met.matches(&pkt), m1.matches(&pkt) && m2.matches(&pkt));
    }
}

#[test]
fn test_scenario_match_and_fwd() {
    // match(srcip=10.0.0.0/24, dstport=80)
    let m = policy(vec![
        ("srcip", Value::from("10.0.0.0/24")),
        ("dstport", Value::Int(80)),
    ]);
    let hit = Packet::new()
        .with(Field::Srcip, Value::from("10.0.0.5"))
        .with(Field::Dstport, 80u64);
    let miss = Packet::new()
        .with(Field::Srcip, Value::from("10.0.0.5"))
        .with(Field::Srcport, 80u64);
    assert_eq!(m.eval(&hit), [hit.clone()].into_iter().collect());
    assert!(m.eval(&miss).is_empty());

    // match(switch=1) >> fwd(2)
    let p = policy(vec![("switch", Value::Int(1))]) >> Policy::Fwd(2);
    let at_sw1 = Packet::new().with(Field::Switch, 1u64);
    let at_sw2 = Packet::new().with(Field::Switch, 2u64);
    let out = p.eval(&at_sw1);
    assert_eq!(out.len(), 1);
    assert_eq!(
        out.into_iter().next().unwrap().get(&Field::Outport),
        Some(&Value::Int(2))
    );
    assert!(p.eval(&at_sw2).is_empty());
}

#[test]
fn test_empty_combinators_are_units() {
    let p = policy(vec![("switch", Value::Int(1))]);
    for pkt in packet_corpus() {
        assert_eq!(Policy::parallel(vec![]).eval(&pkt), Policy::drop().eval(&pkt));
        assert_eq!(
            Policy::sequential(vec![]).eval(&pkt),
            Policy::identity().eval(&pkt)
        );
        // identities of the combinators
        assert_eq!(
            (p.clone() + Policy::drop()).eval(&pkt),
            p.eval(&pkt)
        );
        assert_eq!(
            (p.clone() >> Policy::identity()).eval(&pkt),
            p.eval(&pkt)
        );
    }
}

#[test]
fn test_negating_non_filter_fails_compilation() {
    let c = Policy::Fwd(2).compile().unwrap();
    assert!(c.negate().is_err());
}

#[test]
fn test_classifiers_are_total() {
    let policies = vec![
        policy(vec![("dstport", Value::Int(80))]),
        policy(vec![("switch", Value::Int(1))]) >> Policy::Fwd(2),
        Policy::Controller,
        Policy::XFwd(4),
    ];
    for p in policies {
        let c = p.compile().unwrap();
        for pkt in packet_corpus() {
            assert!(c.lookup(&pkt).is_some(), "no rule matched {pkt:?}");
        }
    }
}

#[test]
fn test_optimize_preserves_semantics() {
    let p = (policy(vec![("srcip", Value::from("10.0.0.0/8"))]) >> Policy::Fwd(2))
        + (policy(vec![("srcip", Value::from("10.0.0.0/24"))]) >> Policy::Fwd(2));
    let raw = p.compile().unwrap();
    let optimized = raw.clone().optimize();
    assert!(optimized.rules.len() <= raw.rules.len());
    for pkt in packet_corpus() {
        assert_eq!(raw.eval(&pkt), optimized.eval(&pkt));
    }
}

#[test]
fn test_dynamic_policy_recompiles_after_replacement() {
    let dynamic = DynamicPolicy::new(Policy::drop());
    let tree = policy(vec![("switch", Value::Int(1))]) >> Policy::Dynamic(dynamic.clone());
    let pkt = Packet::new().with(Field::Switch, 1u64);

    let before = tree.compile().unwrap();
    assert!(before.eval(&pkt).is_empty());

    dynamic.set_policy(Policy::Fwd(7));
    let after = tree.compile().unwrap();
    let out = after.eval(&pkt);
    assert_eq!(out.len(), 1);
    assert_eq!(
        out.into_iter().next().unwrap().get(&Field::Outport),
        Some(&Value::Int(7))
    );
}

#[test]
fn test_modify_then_match_on_rewritten_field() {
    // rewriting dstport makes the downstream web filter pass
    let rewrite = Policy::Modify(field_map(vec![("dstport", Value::Int(80))]));
    let web = policy(vec![("dstport", Value::Int(80))]);
    let p = rewrite >> web;
    let pkt = Packet::new().with(Field::Dstport, 443u64);
    let out = p.eval(&pkt);
    assert_eq!(out.len(), 1);
    assert_sound(&p);
}

#[test]
fn test_controller_and_bucket_rules_are_terminal() {
    let p = Policy::Controller >> Policy::Fwd(2);
    let c = p.compile().unwrap();
    // the controller action must survive; nothing downstream applies
    assert!(c
        .rules
        .iter()
        .any(|r| r.actions.contains(&Action::Controller)));
    for pkt in packet_corpus() {
        assert!(c.eval(&pkt).is_empty());
    }
}

#[test]
fn test_cidr_covers() {
    let wide = Match::from_map(field_map(vec![("srcip", Value::from("10.0.0.0/8"))]));
    let narrow = Match::from_map(field_map(vec![("srcip", Value::from("10.0.0.0/24"))]));
    assert!(wide.covers(&narrow));
    assert!(!narrow.covers(&wide));
    assert!(Match::any().covers(&narrow));
    assert!(!narrow.covers(&Match::any()));
}

#[test]
fn test_classifier_equivalence_is_up_to_dedup() {
    let p = policy(vec![("dstport", Value::Int(80))]);
    let doubled = p.clone() + p.clone();
    let single: Classifier = p.compile().unwrap();
    let both: Classifier = doubled.compile().unwrap();
    for pkt in packet_corpus() {
        assert_eq!(single.eval(&pkt), both.eval(&pkt));
    }
}
