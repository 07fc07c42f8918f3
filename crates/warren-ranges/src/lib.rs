//! Range expression engine for compact node/VM identifier lists.
//!
//! Operators address large sets of instances with expressions like
//! `kn[1-3,100]` instead of spelling out every name. This crate expands
//! such expressions into concrete identifiers and performs the inverse,
//! compressing a set of identifiers back into canonical range syntax for
//! display.
//!
//! Grammar:
//!
//! ```text
//! expr   := token ("," token)*
//! token  := literal | group
//! group  := prefix "[" item ("," item)* "]"
//! item   := number | number "-" number
//! ```
//!
//! Commas inside brackets do not split tokens, so `a[1,2],b` is two
//! tokens. Numeric padding is per item: `008-011` expands zero-padded to
//! three digits, while a sibling `100` in the same group stays unpadded.

use std::collections::BTreeMap;
use thiserror::Error;

/// Result type alias for range parsing operations.
pub type Result<T> = std::result::Result<T, RangeError>;

/// Errors produced while parsing or formatting range expressions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    /// The expression (or the input set for compression) was empty.
    #[error("empty expression")]
    Empty,

    /// Brackets do not pair up, or nest where they may not.
    #[error("unbalanced brackets in `{0}`")]
    UnbalancedBrackets(String),

    /// A bracket group contained no items, or an empty item.
    #[error("empty group in `{0}`")]
    EmptyGroup(String),

    /// A range bound or numeric suffix was not a valid number.
    #[error("invalid number `{0}`")]
    InvalidNumber(String),

    /// A range item runs high to low.
    #[error("invalid range `{0}`: low exceeds high")]
    ReversedRange(String),

    /// The identifier set cannot be expressed as a single range group.
    #[error("cannot compress: {0}")]
    Compress(String),
}

/// Split an expression on top-level commas and expand every token.
///
/// This is the entry point used by the dispatcher for target strings:
/// `"foo,bar[0-1],kn[1,2,3]"` yields six identifiers. Empty tokens from
/// stray commas (`"foo,"`) are dropped rather than producing empty
/// identifiers.
///
/// # Errors
/// Fails on an empty expression or any malformed token.
pub fn split_list(expr: &str) -> Result<Vec<String>> {
    if expr.trim().is_empty() {
        return Err(RangeError::Empty);
    }

    let mut out = Vec::new();
    for token in split_top_level(expr)? {
        out.extend(expand(token)?);
    }
    Ok(out)
}

/// Expand a single token into concrete identifiers.
///
/// A bare token yields itself. A bracketed token yields one identifier
/// per number covered by its items, in source order; ranges expand
/// ascending. Overlapping items are not deduplicated -- each item
/// contributes its own expansion independently.
///
/// # Errors
/// Fails on malformed brackets, empty groups, non-numeric bounds, or a
/// reversed range.
pub fn expand(token: &str) -> Result<Vec<String>> {
    if token.is_empty() {
        return Err(RangeError::Empty);
    }

    let Some(open) = token.find('[') else {
        if token.contains(']') {
            return Err(RangeError::UnbalancedBrackets(token.to_string()));
        }
        return Ok(vec![token.to_string()]);
    };

    if !token.ends_with(']') {
        return Err(RangeError::UnbalancedBrackets(token.to_string()));
    }

    let prefix = &token[..open];
    let inner = &token[open + 1..token.len() - 1];
    if prefix.contains(']') || inner.contains('[') || inner.contains(']') {
        return Err(RangeError::UnbalancedBrackets(token.to_string()));
    }
    if inner.is_empty() {
        return Err(RangeError::EmptyGroup(token.to_string()));
    }

    let mut out = Vec::new();
    for item in inner.split(',') {
        if item.is_empty() {
            return Err(RangeError::EmptyGroup(token.to_string()));
        }

        match item.split_once('-') {
            Some((lo, hi)) => {
                let low = parse_bound(lo)?;
                let high = parse_bound(hi)?;
                if low > high {
                    return Err(RangeError::ReversedRange(item.to_string()));
                }

                // A zero-padded low bound fixes the width for the whole
                // item; an unpadded item expands unpadded.
                let width = if lo.starts_with('0') && lo.len() > 1 {
                    lo.len()
                } else {
                    0
                };
                for n in low..=high {
                    out.push(format!("{prefix}{n:0width$}"));
                }
            }
            None => {
                // Validate, but emit the literal text so padding like
                // `008` survives untouched.
                parse_bound(item)?;
                out.push(format!("{prefix}{item}"));
            }
        }
    }

    Ok(out)
}

/// Compress a set of identifiers sharing one prefix into canonical
/// range syntax.
///
/// Contiguous numeric runs collapse to `low-high`, isolated values stay
/// bare, and groups are emitted in ascending order regardless of input
/// order: `["kn44","kn45","kn1","kn2"]` becomes `"kn[1-2,44-45]"`.
/// Emitted items reuse the literal digit text of the input names, so
/// zero padding is preserved.
///
/// # Errors
/// Fails on an empty set, mixed prefixes, or a name without a numeric
/// suffix.
pub fn compress<S: AsRef<str>>(names: &[S]) -> Result<String> {
    if names.is_empty() {
        return Err(RangeError::Empty);
    }

    let mut prefix: Option<&str> = None;
    let mut numbers: BTreeMap<u64, &str> = BTreeMap::new();

    for name in names {
        let name = name.as_ref();
        let head_len = name.len() - name.bytes().rev().take_while(u8::is_ascii_digit).count();
        let (head, digits) = name.split_at(head_len);
        if digits.is_empty() {
            return Err(RangeError::Compress(format!(
                "`{name}` has no numeric suffix"
            )));
        }

        match prefix {
            None => prefix = Some(head),
            Some(p) if p != head => {
                return Err(RangeError::Compress(format!(
                    "mixed prefixes `{p}` and `{head}`"
                )));
            }
            Some(_) => {}
        }

        let value: u64 = digits
            .parse()
            .map_err(|_| RangeError::InvalidNumber(digits.to_string()))?;
        numbers.entry(value).or_insert(digits);
    }

    let entries: Vec<(u64, &str)> = numbers.into_iter().collect();
    let mut groups = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let mut j = i;
        while j + 1 < entries.len() && entries[j + 1].0 == entries[j].0 + 1 {
            j += 1;
        }
        if i == j {
            groups.push(entries[i].1.to_string());
        } else {
            groups.push(format!("{}-{}", entries[i].1, entries[j].1));
        }
        i = j + 1;
    }

    Ok(format!("{}[{}]", prefix.unwrap_or_default(), groups.join(",")))
}

/// Split on commas outside brackets, dropping empty tokens.
fn split_top_level(expr: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| RangeError::UnbalancedBrackets(expr.to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(RangeError::UnbalancedBrackets(expr.to_string()));
    }
    parts.push(&expr[start..]);

    Ok(parts.into_iter().filter(|t| !t.is_empty()).collect())
}

fn parse_bound(s: &str) -> Result<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::InvalidNumber(s.to_string()));
    }
    s.parse()
        .map_err(|_| RangeError::InvalidNumber(s.to_string()))
}
