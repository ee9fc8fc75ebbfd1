use std::collections::BTreeMap;

use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::classifier::CompileError;
use crate::pred::Pred;

/// First candidate token value; printable ASCII for visual inspection.
pub const TOKEN_START: u32 = 48;

/// Characters with meaning in the regex language; never used as tokens.
pub const LEXER_METACHARS: [char; 22] = [
    '*', '+', '|', '{', '}', '(', ')', '-', '^', '.', '&', '?', '"', '\'', '%', '$', ',', '/',
    '\\', '=', '>', '<',
];

/// Whether a character is part of the regex syntax rather than a token.
pub fn is_metachar(c: char) -> bool {
    LEXER_METACHARS.contains(&c)
}

/// A symbolic name for an equivalence class of filters, rendered as a single
/// character in path expressions.
pub type Token = u32;

/// Renders a token as its expression character.
pub fn char_of(token: Token) -> char {
    char::from_u32(token).expect("token values stay within char range")
}

/// The token a character stands for.
pub fn token_of(c: char) -> Token {
    c as u32
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
/// The point in a packet's journey a token observes.
pub enum TokenKind {
    /// Packet at a switch ingress.
    Ingress,
    /// Packet after the forwarding decision.
    Egress,
    /// Packet at its final network egress.
    EndPath,
    /// Packet dropped by forwarding.
    Drop,
    /// Grouping marker for hooks; exempt from the disjointness invariant.
    Hook,
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("unknown token character {0:?}")]
    UnknownToken(char),
    #[error("token {0:?} does not name a leaf filter")]
    NotLeaf(char),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

#[derive(Debug, Default)]
struct KindTable {
    /// Tokens currently bound to a filter. Invariant: pairwise disjoint.
    leaves: BTreeMap<Token, Pred>,
    /// Tokens that were split: they expand to an alternation of other tokens.
    aliases: BTreeMap<Token, Vec<Token>>,
}

impl KindTable {
    fn token_for(&self, filter: &Pred) -> Option<Token> {
        self.leaves
            .iter()
            .find(|(_, f)| *f == filter)
            .map(|(t, _)| *t)
    }
}

#[derive(Debug)]
/// Allocates tokens for filters, maintaining per kind the invariant that the
/// filters bound to tokens are mutually disjoint while their union still
/// reaches every packet originally mapped.
///
/// When a new filter overlaps existing ones, the overlapped filters are
/// split; their old tokens become *aliases* expanding to the fragments, so
/// path expressions already written in terms of old tokens stay valid.
pub struct TokenTable {
    next: Token,
    kinds: BTreeMap<Token, TokenKind>,
    tables: BTreeMap<TokenKind, KindTable>,
}

impl Default for TokenTable {
    fn default() -> Self {
        TokenTable {
            next: TOKEN_START,
            kinds: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }
}

impl TokenTable {
    pub fn new() -> TokenTable {
        TokenTable::default()
    }

    /// Next unused token whose character is not regex syntax.
    fn fresh_token(&mut self) -> Token {
        loop {
            self.next += 1;
            if !is_metachar(char_of(self.next)) {
                return self.next;
            }
        }
    }

    fn add_leaf(&mut self, filter: Pred, kind: TokenKind) -> Token {
        let token = self.fresh_token();
        self.kinds.insert(token, kind);
        self.tables.entry(kind).or_default().leaves.insert(token, filter);
        token
    }

    /// Returns the token for `filter`, splitting overlapping filters of the
    /// same kind as needed to keep the leaf filters disjoint. A filter
    /// already bound keeps its token.
    pub fn get_token(&mut self, filter: &Pred, kind: TokenKind) -> Result<Token, TokenError> {
        if let Some(token) = self.tables.entry(kind).or_default().token_for(filter) {
            return Ok(token);
        }

        let existing: Vec<(Token, Pred)> = self
            .tables
            .entry(kind)
            .or_default()
            .leaves
            .iter()
            .map(|(t, f)| (*t, f.clone()))
            .collect();

        let mut covered: Option<Pred> = None;
        let mut intersecting_tokens: Vec<Token> = Vec::new();
        for (token, existing_filter) in existing {
            if !existing_filter.overlaps(filter)? {
                continue;
            }
            if existing_filter.overlaps(&!filter.clone())? {
                // Partially overlapped: split the existing filter into the
                // parts outside and inside the new one.
                let table = self.tables.entry(kind).or_default();
                table.leaves.remove(&token);
                let outside = self.add_leaf(
                    existing_filter.clone() & !filter.clone(),
                    kind,
                );
                let inside = self.add_leaf(existing_filter.clone() & filter.clone(), kind);
                self.tables
                    .entry(kind)
                    .or_default()
                    .aliases
                    .insert(token, vec![outside, inside]);
                intersecting_tokens.push(inside);
            } else {
                // Entirely inside the new filter.
                intersecting_tokens.push(token);
            }
            covered = Some(match covered {
                None => existing_filter,
                Some(acc) => acc | existing_filter,
            });
        }

        match covered {
            None => Ok(self.add_leaf(filter.clone(), kind)),
            Some(covered) => {
                let token = self.fresh_token();
                let mut parts = intersecting_tokens;
                if filter.overlaps(&!covered.clone())? {
                    // Part of the new filter lies outside every existing one.
                    parts.push(self.add_leaf(filter.clone() & !covered, kind));
                }
                self.kinds.insert(token, kind);
                self.tables.entry(kind).or_default().aliases.insert(token, parts);
                Ok(token)
            }
        }
    }

    /// Allocates a token without the disjointness requirement (hook group
    /// markers).
    pub fn get_token_overlapping(&mut self, filter: Pred, kind: TokenKind) -> Token {
        self.add_leaf(filter, kind)
    }

    /// The kind a token was allocated under.
    pub fn kind_of(&self, token: Token) -> Option<TokenKind> {
        self.kinds.get(&token).copied()
    }

    /// The filter a token stands for, expanding aliases into unions.
    pub fn filter_of(&self, token: Token) -> Result<Pred, TokenError> {
        let kind = self
            .kind_of(token)
            .ok_or_else(|| TokenError::UnknownToken(char_of(token)))?;
        let table = self.tables.get(&kind).expect("kind recorded without table");
        if let Some(filter) = table.leaves.get(&token) {
            return Ok(filter.clone());
        }
        let parts = table
            .aliases
            .get(&token)
            .ok_or_else(|| TokenError::UnknownToken(char_of(token)))?;
        let mut filters = Vec::with_capacity(parts.len());
        for part in parts {
            filters.push(self.filter_of(*part)?);
        }
        Ok(Pred::union(filters))
    }

    /// Decodes a DFA edge label into one filter per token kind: the union of
    /// the labelled leaf filters, inverted when the label is negated.
    pub fn decode_label(
        &self,
        label: &[char],
        negated: bool,
    ) -> Result<BTreeMap<TokenKind, Pred>, TokenError> {
        let mut by_kind: BTreeMap<TokenKind, Pred> = BTreeMap::new();
        for c in label {
            let token = token_of(*c);
            let kind = self
                .kind_of(token)
                .ok_or(TokenError::UnknownToken(*c))?;
            let table = self.tables.get(&kind).expect("kind recorded without table");
            let filter = table
                .leaves
                .get(&token)
                .ok_or(TokenError::NotLeaf(*c))?
                .clone();
            by_kind
                .entry(kind)
                .and_modify(|acc| *acc = acc.clone() | filter.clone())
                .or_insert(filter);
        }
        if negated {
            Ok(by_kind.into_iter().map(|(k, f)| (k, !f)).collect())
        } else {
            Ok(by_kind)
        }
    }

    /// Rewrites a regex over original tokens into one over leaf tokens only,
    /// expanding every aliased character into a parenthesized alternation of
    /// its fragments. Regex metacharacters pass through.
    pub fn terminal_expression(&self, expr: &str) -> Result<String, TokenError> {
        let mut out = String::new();
        for c in expr.chars() {
            out.push_str(&self.terminal_expression_for_char(c)?);
        }
        Ok(out)
    }

    fn terminal_expression_for_char(&self, c: char) -> Result<String, TokenError> {
        if is_metachar(c) {
            return Ok(c.to_string());
        }
        let token = token_of(c);
        let kind = self
            .kind_of(token)
            .ok_or(TokenError::UnknownToken(c))?;
        let table = self.tables.get(&kind).expect("kind recorded without table");
        match table.aliases.get(&token) {
            None => Ok(c.to_string()),
            Some(parts) => {
                let mut expanded = String::from("(");
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        expanded.push('|');
                    }
                    expanded.push_str(&self.terminal_expression_for_char(char_of(*part))?);
                }
                expanded.push(')');
                Ok(expanded)
            }
        }
    }

    /// All leaf token characters, the alphabet DFA construction runs over.
    pub fn alphabet(&self) -> Vec<char> {
        let mut chars: Vec<char> = self
            .tables
            .values()
            .flat_map(|t| t.leaves.keys().map(|t| char_of(*t)))
            .collect();
        chars.sort_unstable();
        chars
    }
}
