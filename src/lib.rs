//! netpol is a library for programming software-defined networks as algebraic
//! expressions: filters, header rewrites and parallel/sequential composition
//! build network-wide policies, which compile into the prioritized
//! match/action rule tables switches actually run.
//!
//! On top of the policy algebra, a *path* sub-language expresses regular
//! expression queries over the trajectories packets take through the network;
//! its compiler turns them into tagging and capture policy fragments driven
//! by a per-packet DFA state. Measurement buckets collect the results, either
//! as controller-delivered packets or as byte/packet totals reconstructed
//! from switch flow counters.

/// Contains header field names and field values.
pub mod types;

/// Contains the located-packet representation used by policy evaluation.
pub mod packet;

/// Contains match predicates and the Boolean filter algebra.
pub mod pred;

/// Contains classifiers: prioritized rule tables and the algebra
/// (parallel, sequential, negation) that compiles policies onto them.
pub mod classifier;

/// Contains the policy AST, its evaluation, and compilation.
pub mod policy;

/// Contains measurement buckets and the flow-counter pull protocol.
pub mod bucket;

/// Contains the token generator keeping path-atom filters disjoint.
pub mod token;

/// Contains the regular expression engine behind the DFA service.
pub mod regex;

/// Contains DFA construction and regex set operations.
pub mod dfa;

/// Contains the path query algebra and its compiler.
pub mod path;

/// Contains the virtual field layer packing logical tags into VLAN bits.
pub mod vfield;

/// Contains node visitors for serde.
pub mod visitor;
