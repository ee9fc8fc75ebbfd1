use std::collections::BTreeSet;
use std::iter::Peekable;
use std::str::CharIndices;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegexError {
    #[error("unexpected character {ch:?} at offset {pos}")]
    Unexpected { pos: usize, ch: char },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("empty character class at offset {pos}")]
    EmptyClass { pos: usize },
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
/// A character class: a set of characters, possibly complemented.
pub struct CharClass {
    pub negated: bool,
    pub chars: BTreeSet<char>,
}

impl CharClass {
    pub fn single(c: char) -> CharClass {
        CharClass {
            negated: false,
            chars: BTreeSet::from([c]),
        }
    }

    pub fn contains(&self, c: char) -> bool {
        self.chars.contains(&c) != self.negated
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
/// Regular expressions in canonical form, extended with intersection (`&`)
/// and complement (`~`) as the path compiler's merged expressions need them.
pub enum Regex {
    /// Matches no string.
    Empty,
    /// Matches the empty string.
    Epsilon,
    /// Matches one character of the class.
    Class(CharClass),
    /// Concatenation; at least two parts, none trivial.
    Concat(Vec<Regex>),
    /// Alternation; flattened, deduplicated.
    Alt(BTreeSet<Regex>),
    /// Intersection; flattened, deduplicated.
    And(BTreeSet<Regex>),
    /// Kleene star.
    Star(Box<Regex>),
    /// Complement.
    Not(Box<Regex>),
}

impl Regex {
    pub fn class(c: CharClass) -> Regex {
        Regex::Class(c)
    }

    /// Smart constructor: concatenation with unit and zero laws applied.
    pub fn concat(parts: Vec<Regex>) -> Regex {
        let mut flat = Vec::new();
        for p in parts {
            match p {
                Regex::Epsilon => {}
                Regex::Empty => return Regex::Empty,
                Regex::Concat(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Regex::Epsilon,
            1 => flat.into_iter().next().expect("length checked"),
            _ => Regex::Concat(flat),
        }
    }

    /// Smart constructor: alternation, flattened and deduplicated.
    pub fn alt(parts: Vec<Regex>) -> Regex {
        let mut set = BTreeSet::new();
        for p in parts {
            match p {
                Regex::Empty => {}
                Regex::Alt(inner) => set.extend(inner),
                other => {
                    set.insert(other);
                }
            }
        }
        if set.contains(&Regex::Not(Box::new(Regex::Empty))) {
            return Regex::Not(Box::new(Regex::Empty));
        }
        match set.len() {
            0 => Regex::Empty,
            1 => set.into_iter().next().expect("length checked"),
            _ => Regex::Alt(set),
        }
    }

    /// Smart constructor: intersection, flattened and deduplicated.
    pub fn and(parts: Vec<Regex>) -> Regex {
        let mut set = BTreeSet::new();
        for p in parts {
            match p {
                Regex::Empty => return Regex::Empty,
                Regex::And(inner) => set.extend(inner),
                // the universal language is the unit of intersection
                Regex::Not(inner) if *inner == Regex::Empty => {}
                other => {
                    set.insert(other);
                }
            }
        }
        match set.len() {
            0 => Regex::Not(Box::new(Regex::Empty)),
            1 => set.into_iter().next().expect("length checked"),
            _ => Regex::And(set),
        }
    }

    /// Smart constructor: Kleene star.
    pub fn star(inner: Regex) -> Regex {
        match inner {
            Regex::Empty | Regex::Epsilon => Regex::Epsilon,
            s @ Regex::Star(_) => s,
            other => Regex::Star(Box::new(other)),
        }
    }

    /// Smart constructor: complement.
    pub fn not(inner: Regex) -> Regex {
        match inner {
            Regex::Not(r) => *r,
            other => Regex::Not(Box::new(other)),
        }
    }

    /// `r?` desugars to `r | ε`.
    pub fn optional(inner: Regex) -> Regex {
        Regex::alt(vec![inner, Regex::Epsilon])
    }

    /// Whether the language contains the empty string.
    pub fn nullable(&self) -> bool {
        match self {
            Regex::Empty | Regex::Class(_) => false,
            Regex::Epsilon | Regex::Star(_) => true,
            Regex::Concat(parts) => parts.iter().all(Regex::nullable),
            Regex::Alt(parts) => parts.iter().any(Regex::nullable),
            Regex::And(parts) => parts.iter().all(Regex::nullable),
            Regex::Not(inner) => !inner.nullable(),
        }
    }

    /// The Brzozowski derivative with respect to `c`.
    pub fn derivative(&self, c: char) -> Regex {
        match self {
            Regex::Empty | Regex::Epsilon => Regex::Empty,
            Regex::Class(class) => {
                if class.contains(c) {
                    Regex::Epsilon
                } else {
                    Regex::Empty
                }
            }
            Regex::Concat(parts) => {
                let head = &parts[0];
                let tail = Regex::concat(parts[1..].to_vec());
                let step = Regex::concat(vec![head.derivative(c), tail.clone()]);
                if head.nullable() {
                    Regex::alt(vec![step, tail.derivative(c)])
                } else {
                    step
                }
            }
            Regex::Alt(parts) => Regex::alt(parts.iter().map(|p| p.derivative(c)).collect()),
            Regex::And(parts) => Regex::and(parts.iter().map(|p| p.derivative(c)).collect()),
            Regex::Star(inner) => {
                Regex::concat(vec![inner.derivative(c), Regex::star((**inner).clone())])
            }
            Regex::Not(inner) => Regex::not(inner.derivative(c)),
        }
    }

    /// Whether the regex accepts the given string.
    pub fn accepts(&self, input: &str) -> bool {
        let mut current = self.clone();
        for c in input.chars() {
            current = current.derivative(c);
        }
        current.nullable()
    }
}

/// Parses the regex dialect of the path compiler: concatenation,
/// alternation `|`, intersection `&`, complement `~`, Kleene star `*`,
/// option `?`, character classes `[…]` / `[^…]` with ranges, parentheses,
/// and backslash escapes. Whitespace is insignificant; token characters
/// start at ASCII 48, so no token is whitespace.
pub fn parse(input: &str) -> Result<Regex, RegexError> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let mut chars = cleaned.char_indices().peekable();
    let re = parse_alt(&mut chars)?;
    match chars.next() {
        None => Ok(re),
        Some((pos, ch)) => Err(RegexError::Unexpected { pos, ch }),
    }
}

type Stream<'a> = Peekable<CharIndices<'a>>;

fn parse_alt(chars: &mut Stream) -> Result<Regex, RegexError> {
    let mut parts = vec![parse_and(chars)?];
    while matches!(chars.peek(), Some((_, '|'))) {
        chars.next();
        parts.push(parse_and(chars)?);
    }
    Ok(Regex::alt(parts))
}

fn parse_and(chars: &mut Stream) -> Result<Regex, RegexError> {
    let mut parts = vec![parse_concat(chars)?];
    while matches!(chars.peek(), Some((_, '&'))) {
        chars.next();
        parts.push(parse_concat(chars)?);
    }
    Ok(Regex::and(parts))
}

fn parse_concat(chars: &mut Stream) -> Result<Regex, RegexError> {
    let mut parts = Vec::new();
    while let Some((_, ch)) = chars.peek() {
        match ch {
            '|' | '&' | ')' => break,
            _ => parts.push(parse_unary(chars)?),
        }
    }
    Ok(Regex::concat(parts))
}

fn parse_unary(chars: &mut Stream) -> Result<Regex, RegexError> {
    if matches!(chars.peek(), Some((_, '~'))) {
        chars.next();
        let inner = parse_unary(chars)?;
        return Ok(Regex::not(inner));
    }
    let mut re = parse_atom(chars)?;
    loop {
        match chars.peek() {
            Some((_, '*')) => {
                chars.next();
                re = Regex::star(re);
            }
            Some((_, '?')) => {
                chars.next();
                re = Regex::optional(re);
            }
            _ => break,
        }
    }
    Ok(re)
}

fn parse_atom(chars: &mut Stream) -> Result<Regex, RegexError> {
    match chars.next() {
        None => Err(RegexError::UnexpectedEnd),
        Some((_, '(')) => {
            let inner = parse_alt(chars)?;
            match chars.next() {
                Some((_, ')')) => Ok(inner),
                Some((pos, ch)) => Err(RegexError::Unexpected { pos, ch }),
                None => Err(RegexError::UnexpectedEnd),
            }
        }
        Some((pos, '[')) => parse_class(chars, pos),
        Some((_, '\\')) => match chars.next() {
            Some((_, ch)) => Ok(Regex::class(CharClass::single(ch))),
            None => Err(RegexError::UnexpectedEnd),
        },
        Some((pos, ch)) if "*?|&)".contains(ch) => Err(RegexError::Unexpected { pos, ch }),
        Some((_, ch)) => Ok(Regex::class(CharClass::single(ch))),
    }
}

fn parse_class(chars: &mut Stream, start: usize) -> Result<Regex, RegexError> {
    let mut negated = false;
    if matches!(chars.peek(), Some((_, '^'))) {
        chars.next();
        negated = true;
    }
    let mut set = BTreeSet::new();
    loop {
        match chars.next() {
            None => return Err(RegexError::UnexpectedEnd),
            Some((_, ']')) => break,
            Some((_, '\\')) => match chars.next() {
                Some((_, ch)) => {
                    set.insert(ch);
                }
                None => return Err(RegexError::UnexpectedEnd),
            },
            Some((_, lo)) => {
                if matches!(chars.peek(), Some((_, '-'))) {
                    chars.next();
                    match chars.next() {
                        None => return Err(RegexError::UnexpectedEnd),
                        Some((_, ']')) => {
                            // trailing '-' is literal
                            set.insert(lo);
                            set.insert('-');
                            break;
                        }
                        Some((_, hi)) => {
                            for c in lo as u32..=hi as u32 {
                                if let Some(c) = char::from_u32(c) {
                                    set.insert(c);
                                }
                            }
                        }
                    }
                } else {
                    set.insert(lo);
                }
            }
        }
    }
    if set.is_empty() {
        return Err(RegexError::EmptyClass { pos: start });
    }
    Ok(Regex::class(CharClass { negated, chars: set }))
}
