use std::collections::{BTreeMap, HashMap, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::regex::{parse, Regex, RegexError};

#[derive(Error, Debug)]
pub enum DfaError {
    #[error(transparent)]
    Regex(#[from] RegexError),
    #[error("malformed rule line {0:?}")]
    MalformedRule(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
/// A labelled DFA transition. The label is a character class: the listed
/// characters when `negated` is false, everything else in the alphabet when
/// true.
pub struct Edge {
    pub src: usize,
    pub dst: usize,
    pub label: Vec<char>,
    pub negated: bool,
}

#[derive(Clone, Debug, Default)]
/// A deterministic automaton over a token alphabet. State 0 is the start
/// state; accepting states carry the index of the accepted regex (lowest
/// index wins, as in a lexer).
pub struct Dfa {
    num_states: usize,
    edges: Vec<Edge>,
    accepting: BTreeMap<usize, usize>,
}

impl Dfa {
    pub fn start(&self) -> usize {
        0
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// The index of the regex this state accepts, if any.
    pub fn accepting_index(&self, state: usize) -> Option<usize> {
        self.accepting.get(&state).copied()
    }

    pub fn num_accepting_states(&self) -> usize {
        self.accepting.len()
    }
}

/// Renders a regex list in the rule format the DFA service accepts: one
/// `"<regex> => ( expr_i );"` line per regex.
pub fn lexer_input(regexes: &[String]) -> String {
    let mut out = String::new();
    for (i, re) in regexes.iter().enumerate() {
        out.push_str(re);
        out.push_str(&format!(" => ( expr_{i} );\n"));
    }
    out
}

/// Builds the DFA for a rule list in the `"<regex> => ( expr_i );"` format,
/// over the given alphabet.
pub fn build(rules: &str, alphabet: &[char]) -> Result<Dfa, DfaError> {
    let mut regexes = Vec::new();
    for line in rules.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (re, _) = line
            .rsplit_once(" => ")
            .ok_or_else(|| DfaError::MalformedRule(line.to_string()))?;
        regexes.push(parse(re.trim())?);
    }
    Ok(construct(regexes, alphabet))
}

/// Convenience wrapper: renders the rule text for `regexes` and builds its
/// DFA.
pub fn regexes_to_dfa(regexes: &[String], alphabet: &[char]) -> Result<Dfa, DfaError> {
    build(&lexer_input(regexes), alphabet)
}

/// Subset-free DFA construction by Brzozowski derivatives: a state is the
/// vector of derivatives of every rule regex, so acceptance can name the
/// rule index directly.
fn construct(regexes: Vec<Regex>, alphabet: &[char]) -> Dfa {
    let start: Vec<Regex> = regexes;
    let dead: Vec<Regex> = start.iter().map(|_| Regex::Empty).collect();

    let mut ids: HashMap<Vec<Regex>, usize> = HashMap::new();
    let mut states: Vec<Vec<Regex>> = Vec::new();
    let mut worklist: VecDeque<usize> = VecDeque::new();
    ids.insert(start.clone(), 0);
    states.push(start);
    worklist.push_back(0);

    // (src, dst) -> chars, in first-seen order
    let mut transitions: Vec<(usize, usize, Vec<char>)> = Vec::new();
    let mut live_chars: Vec<Vec<char>> = Vec::new();

    while let Some(src) = worklist.pop_front() {
        let state = states[src].clone();
        live_chars.resize(states.len().max(src + 1), Vec::new());
        for &c in alphabet {
            let next: Vec<Regex> = state.iter().map(|r| r.derivative(c)).collect();
            if next == dead {
                continue;
            }
            let dst = match ids.get(&next) {
                Some(id) => *id,
                None => {
                    let id = states.len();
                    ids.insert(next.clone(), id);
                    states.push(next);
                    worklist.push_back(id);
                    id
                }
            };
            live_chars.resize(states.len(), Vec::new());
            live_chars[src].push(c);
            match transitions.iter_mut().find(|(s, d, _)| *s == src && *d == dst) {
                Some((_, _, chars)) => chars.push(c),
                None => transitions.push((src, dst, vec![c])),
            }
        }
    }

    let num_live = states.len();
    let mut edges: Vec<Edge> = transitions
        .into_iter()
        .map(|(src, dst, label)| Edge {
            src,
            dst,
            label,
            negated: false,
        })
        .collect();

    // Complete the automaton: characters with no live transition lead to a
    // dead state, expressed as one negated-class edge per state. Without
    // these, a packet matching no expected token would keep its tag and
    // could resume a path later.
    live_chars.resize(num_live, Vec::new());
    let needs_dead = live_chars
        .iter()
        .take(num_live)
        .any(|chars| chars.len() < alphabet.len());
    let mut num_states = num_live;
    if needs_dead && !alphabet.is_empty() {
        let dead_id = num_live;
        num_states += 1;
        for (src, chars) in live_chars.iter().take(num_live).enumerate() {
            if chars.len() == alphabet.len() {
                continue;
            }
            if chars.is_empty() {
                edges.push(Edge {
                    src,
                    dst: dead_id,
                    label: alphabet.to_vec(),
                    negated: false,
                });
            } else {
                edges.push(Edge {
                    src,
                    dst: dead_id,
                    label: chars.clone(),
                    negated: true,
                });
            }
        }
    }

    let mut accepting = BTreeMap::new();
    for (id, state) in states.iter().enumerate() {
        if let Some(idx) = state.iter().position(Regex::nullable) {
            accepting.insert(id, idx);
        }
    }

    debug!(
        states = num_states,
        edges = edges.len(),
        accepting = accepting.len(),
        "constructed dfa"
    );
    Dfa {
        num_states,
        edges,
        accepting,
    }
}

/// Whether the intersection of two regexes is the empty language over the
/// given alphabet.
pub fn intersection_is_null(re1: &str, re2: &str, alphabet: &[char]) -> Result<bool, DfaError> {
    let combined = Regex::and(vec![parse(re1)?, parse(re2)?]);
    let dfa = construct(vec![combined], alphabet);
    Ok(dfa.num_accepting_states() == 0)
}

/// Whether two regexes denote the same language.
pub fn re_equals(re1: &str, re2: &str, alphabet: &[char]) -> Result<bool, DfaError> {
    let nre1 = format!("~({re1})");
    let nre2 = format!("~({re2})");
    Ok(intersection_is_null(re1, &nre2, alphabet)?
        && intersection_is_null(&nre1, re2, alphabet)?)
}

/// Whether `re1`'s language is a subset of `re2`'s (including equality).
pub fn re_subset(re1: &str, re2: &str, alphabet: &[char]) -> Result<bool, DfaError> {
    let nre2 = format!("~({re2})");
    intersection_is_null(re1, &nre2, alphabet)
}

/// Whether the two regexes share any string.
pub fn re_overlaps(re1: &str, re2: &str, alphabet: &[char]) -> Result<bool, DfaError> {
    Ok(!intersection_is_null(re1, re2, alphabet)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AB: [char; 2] = ['a', 'b'];

    /// Runs the DFA on a string, following explicit and negated labels.
    fn run(dfa: &Dfa, input: &str) -> Option<usize> {
        let mut state = dfa.start();
        'chars: for c in input.chars() {
            for e in dfa.edges() {
                if e.src == state && (e.label.contains(&c) != e.negated) {
                    state = e.dst;
                    continue 'chars;
                }
            }
            return None;
        }
        dfa.accepting_index(state)
    }

    #[test]
    fn single_regex_dfa() {
        let dfa = regexes_to_dfa(&["ab".to_string()], &AB).unwrap();
        assert_eq!(run(&dfa, "ab"), Some(0));
        assert_eq!(run(&dfa, "a"), None);
        assert_eq!(run(&dfa, "ba"), None);
    }

    #[test]
    fn unexpected_characters_go_dead() {
        let dfa = regexes_to_dfa(&["ab".to_string()], &AB).unwrap();
        // after 'a', a second 'a' must not leave the path in state 1
        assert_eq!(run(&dfa, "aab"), None);
    }

    #[test]
    fn accepting_index_prefers_first_rule() {
        let dfa = regexes_to_dfa(&["a*".to_string(), "a".to_string()], &AB).unwrap();
        assert_eq!(run(&dfa, "a"), Some(0));
    }

    #[test]
    fn rule_text_round_trips() {
        let text = lexer_input(&["ab".to_string(), "a*".to_string()]);
        assert!(text.contains("ab => ( expr_0 );"));
        assert!(text.contains("a* => ( expr_1 );"));
        let dfa = build(&text, &AB).unwrap();
        assert_eq!(run(&dfa, "ab"), Some(0));
    }

    #[test]
    fn regex_set_operations() {
        assert!(re_equals("a|b", "b|a", &AB).unwrap());
        assert!(re_subset("a", "a|b", &AB).unwrap());
        assert!(!re_subset("a|b", "a", &AB).unwrap());
        assert!(re_overlaps("a*b", "ab", &AB).unwrap());
        assert!(!re_overlaps("a", "b", &AB).unwrap());
    }
}
