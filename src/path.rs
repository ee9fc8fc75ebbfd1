use std::collections::BTreeMap;
use std::ops::{BitOr, BitXor};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::bucket::{CountBucket, FwdBucket, PacketCallback};
use crate::classifier::CompileError;
use crate::dfa::{self, DfaError};
use crate::policy::Policy;
use crate::pred::Pred;
use crate::token::{char_of, TokenError, TokenKind, TokenTable};
use crate::types::{Field, FieldMap, Value};
use crate::vfield::{VirtualFieldError, VirtualFields};

/// The virtual field carrying the DFA state of each packet.
pub const PATH_TAG: &str = "path_tag";

#[derive(Error, Debug)]
pub enum PathError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Dfa(#[from] DfaError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    VirtualField(#[from] VirtualFieldError),
    #[error("hook requires at least one group-by field")]
    EmptyGroupBy,
}

#[derive(Clone, Debug)]
/// Where a path query delivers its results.
pub enum PathEndpoint {
    /// Per-packet callbacks on controller copies (the default).
    Fwd(Arc<FwdBucket>),
    /// Traffic volumes from switch counters.
    Count(Arc<CountBucket>),
}

#[derive(Clone, Debug)]
/// A query over the trajectories packets take through the network,
/// expressed as a regular expression over path atoms.
pub struct Path {
    expr: String,
    endpoint: PathEndpoint,
    groupby: Vec<Field>,
}

impl Path {
    fn from_expr(expr: String) -> Path {
        Path {
            expr,
            endpoint: PathEndpoint::Fwd(FwdBucket::new()),
            groupby: Vec::new(),
        }
    }

    /// The regex over token characters this path denotes.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// The fields a hook groups results by; empty for plain atoms and
    /// composites.
    pub fn groupby(&self) -> &[Field] {
        &self.groupby
    }

    pub fn endpoint(&self) -> &PathEndpoint {
        &self.endpoint
    }

    /// Routes this query's results into a count bucket instead of the
    /// default packet bucket.
    pub fn with_count_bucket(mut self, bucket: Arc<CountBucket>) -> Path {
        self.endpoint = PathEndpoint::Count(bucket);
        self
    }

    /// Registers a per-packet callback on the default packet bucket.
    /// No-op for count endpoints, whose callbacks live on the count bucket.
    pub fn register_callback(&self, f: PacketCallback) {
        if let PathEndpoint::Fwd(bucket) = &self.endpoint {
            bucket.register_callback(f);
        }
    }

    /// Kleene star over this path.
    pub fn star(&self) -> Path {
        Path::from_expr(format!("({})*", self.expr))
    }

    /// The policy leaf delivering to this path's bucket.
    fn bucket_policy(&self) -> Policy {
        match &self.endpoint {
            PathEndpoint::Fwd(b) => Policy::FwdBucket(b.clone()),
            PathEndpoint::Count(b) => Policy::CountBucket(b.clone()),
        }
    }
}

impl BitXor for Path {
    type Output = Path;

    /// Path concatenation.
    fn bitxor(self, rhs: Path) -> Path {
        Path::from_expr(format!("{}{}", self.expr, rhs.expr))
    }
}

impl BitOr for Path {
    type Output = Path;

    /// Path alternation.
    fn bitor(self, rhs: Path) -> Path {
        Path::from_expr(format!("(({})|({}))", self.expr, rhs.expr))
    }
}

/// The five policy fragments realizing a set of path queries. Stitched with
/// the forwarding policy, they maintain the per-packet `path_tag` and route
/// matching packets to the query buckets.
pub struct PathFragments {
    /// Advances the tag along DFA transitions at switch ingress; packets
    /// covered by no transition pass through unchanged.
    pub tagging: Policy,
    /// Clears the tag at network egress.
    pub untagging: Policy,
    /// Deliveries for paths accepted at switch ingress.
    pub capture_ingress: Policy,
    /// Deliveries for paths accepted at network egress.
    pub capture_endpath: Policy,
    /// Deliveries for paths accepted on dropped packets. Generated but not
    /// stitched.
    pub capture_drop: Policy,
}

/// Compiles path queries: atoms allocate disjoint tokens, finalized paths
/// merge into a non-overlapping regex list, and the resulting DFA is emitted
/// as tagging and capture policy fragments.
#[derive(Debug, Default)]
pub struct PathCompiler {
    tokens: TokenTable,
    re_list: Vec<String>,
    paths: Vec<Vec<Path>>,
}

impl PathCompiler {
    pub fn new() -> PathCompiler {
        PathCompiler::default()
    }

    /// The token table (for inspection).
    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    /// The merged regex list (for inspection).
    pub fn regexes(&self) -> &[String] {
        &self.re_list
    }

    fn atom_of_kind(&mut self, filter: Pred, kind: TokenKind) -> Result<Path, PathError> {
        let token = self.tokens.get_token(&filter, kind)?;
        Ok(Path::from_expr(char_of(token).to_string()))
    }

    /// An atom observing packets at switch ingress.
    pub fn atom(&mut self, filter: Pred) -> Result<Path, PathError> {
        self.atom_of_kind(filter, TokenKind::Ingress)
    }

    /// An atom observing packets after the forwarding decision.
    pub fn egress_atom(&mut self, filter: Pred) -> Result<Path, PathError> {
        self.atom_of_kind(filter, TokenKind::Egress)
    }

    /// An atom observing packets dropped by the forwarding policy.
    pub fn drop_atom(&mut self, filter: Pred) -> Result<Path, PathError> {
        self.atom_of_kind(filter, TokenKind::Drop)
    }

    /// An atom observing packets at their final network egress.
    pub fn end_path(&mut self, filter: Pred) -> Result<Path, PathError> {
        self.atom_of_kind(filter, TokenKind::EndPath)
    }

    /// An atom that additionally groups results by the given fields.
    pub fn hook(&mut self, filter: Pred, groupby: &[Field]) -> Result<Path, PathError> {
        if groupby.is_empty() {
            return Err(PathError::EmptyGroupBy);
        }
        let token = self.tokens.get_token(&filter, TokenKind::Ingress)?;
        let group_token = self
            .tokens
            .get_token_overlapping(Pred::Identity, TokenKind::Hook);
        let mut path = Path::from_expr(format!(
            "{}({}?)",
            char_of(token),
            char_of(group_token)
        ));
        path.groupby = groupby.to_vec();
        Ok(path)
    }

    /// Adds a finalized path to the compiled set: its expression is reduced
    /// to leaf tokens and merged into the global list of non-overlapping
    /// regexes.
    pub fn finalize(&mut self, path: &Path) -> Result<(), PathError> {
        let expr = self.tokens.terminal_expression(path.expr())?;
        debug!(%expr, "finalizing path");
        self.append_without_intersection(expr, path)
    }

    /// Finalizes every path in the list.
    pub fn compile(&mut self, paths: &[Path]) -> Result<(), PathError> {
        for p in paths {
            self.finalize(p)?;
        }
        Ok(())
    }

    /// Merges `new_re` into the regex list, keeping entries pairwise
    /// disjoint: equal and subset entries adopt the path, partially
    /// overlapping entries are split into inside/outside parts, and only the
    /// part of `new_re` covered by nothing becomes a fresh entry.
    fn append_without_intersection(&mut self, new_re: String, path: &Path) -> Result<(), PathError> {
        let alphabet = self.tokens.alphabet();
        let mut intersecting: Vec<String> = Vec::new();
        let initial_len = self.re_list.len();
        for i in 0..initial_len {
            let existing = self.re_list[i].clone();
            if dfa::re_equals(&existing, &new_re, &alphabet)? {
                self.paths[i].push(path.clone());
                return Ok(());
            } else if dfa::re_subset(&existing, &new_re, &alphabet)? {
                self.paths[i].push(path.clone());
                intersecting.push(existing);
            } else if dfa::re_overlaps(&existing, &new_re, &alphabet)? {
                // keep the non-intersecting part in place, split off the
                // intersection as a new entry owning both path sets
                self.re_list[i] = format!("({existing}) & ~({new_re})");
                let mut shared = self.paths[i].clone();
                shared.push(path.clone());
                self.re_list.push(format!("({existing}) & ({new_re})"));
                self.paths.push(shared);
                intersecting.push(existing);
            }
        }
        let final_re = if intersecting.is_empty() {
            new_re
        } else {
            let all = intersecting.join("|");
            if dfa::re_subset(&new_re, &all, &alphabet)? {
                // already fully covered; the path references were added above
                return Ok(());
            }
            format!("({new_re}) & ~({all})")
        };
        self.re_list.push(final_re);
        self.paths.push(vec![path.clone()]);
        Ok(())
    }

    /// Builds the DFA for the finalized paths, registers the `path_tag`
    /// virtual field over its states, and emits the five policy fragments.
    pub fn fragments(
        &mut self,
        vfields: &mut VirtualFields,
        egress: &Pred,
    ) -> Result<PathFragments, PathError> {
        let alphabet = self.tokens.alphabet();
        let dfa = dfa::regexes_to_dfa(&self.re_list, &alphabet)?;
        info!(
            states = dfa.num_states(),
            regexes = self.re_list.len(),
            "compiled path queries"
        );
        vfields.register(
            PATH_TAG,
            (0..dfa.num_states() as u64).map(Value::Int).collect(),
        )?;

        let mut tagging = Policy::drop();
        let mut untagged = Pred::Identity;
        let mut captures: BTreeMap<TokenKind, Policy> = BTreeMap::new();

        for edge in dfa.edges() {
            let by_kind = self.tokens.decode_label(&edge.label, edge.negated)?;
            if let Some(ingress) = by_kind.get(&TokenKind::Ingress) {
                let transit = match_tag(edge.src) & ingress.clone();
                tagging = tagging + (Policy::Filter(transit.clone()) >> set_tag(edge.dst));
                untagged = untagged & !transit;
            }
            if let Some(index) = dfa.accepting_index(edge.dst) {
                for path in &self.paths[index] {
                    for kind in [TokenKind::Ingress, TokenKind::EndPath, TokenKind::Drop] {
                        if let Some(filter) = by_kind.get(&kind) {
                            let capture = Policy::Filter(match_tag(edge.src) & filter.clone())
                                >> path.bucket_policy();
                            captures
                                .entry(kind)
                                .and_modify(|acc| *acc = acc.clone() + capture.clone())
                                .or_insert(capture);
                        }
                    }
                }
            }
        }

        // preserve packets covered by no transition as they are
        tagging = tagging + Policy::Filter(untagged);

        let untagging = (Policy::Filter(egress.clone()) >> set_tag(0))
            + Policy::Filter(!egress.clone());

        let mut capture_of = |kind: TokenKind| captures.remove(&kind).unwrap_or_else(Policy::drop);
        Ok(PathFragments {
            tagging,
            untagging,
            capture_ingress: capture_of(TokenKind::Ingress),
            capture_endpath: capture_of(TokenKind::EndPath),
            capture_drop: capture_of(TokenKind::Drop),
        })
    }

    /// Stitches the fragments with the user's forwarding policy into the
    /// globally effective network policy: tagged forwarding on the critical
    /// path, plus captures at ingress and at network egress.
    pub fn stitch(forwarding: Policy, fragments: &PathFragments, egress: &Pred) -> Policy {
        (fragments.tagging.clone() >> forwarding.clone())
            + fragments.capture_ingress.clone()
            + (fragments.tagging.clone()
                >> forwarding
                >> Policy::Filter(egress.clone())
                >> fragments.capture_endpath.clone())
    }
}

/// The filter selecting packets in the given DFA state. State 0 is the
/// start state, encoded as an absent tag.
fn match_tag(state: usize) -> Pred {
    Pred::matching(FieldMap::from([(
        Field::Virtual(PATH_TAG.to_string()),
        tag_value(state),
    )]))
}

/// The rewrite moving a packet into the given DFA state.
fn set_tag(state: usize) -> Policy {
    Policy::Modify(FieldMap::from([(
        Field::Virtual(PATH_TAG.to_string()),
        tag_value(state),
    )]))
}

fn tag_value(state: usize) -> Value {
    if state == 0 {
        Value::None
    } else {
        Value::Int(state as u64)
    }
}
