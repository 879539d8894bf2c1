//! Server-assigned, monotonically increasing item identifiers.
//!
//! Mastodon and Pleroma hand out ids as strings. They are usually decimal
//! snowflakes, but some servers exceed the 64-bit range and Pleroma flake ids
//! are alphanumeric, so ids are never parsed for comparison: a longer id is
//! always newer, and ids of equal length compare lexicographically.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// An opaque, ordered item id. `a > b` iff `a` is newer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedId(String);

impl OrderedId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The smallest id strictly greater than this one.
    ///
    /// Digit-only ids that fit in a `u128` go through integer arithmetic; anything
    /// else (overflowing snowflakes, zero-padded ids, flake ids) is carried
    /// character by character so the width is kept.
    pub fn increment(&self) -> OrderedId {
        if is_canonical_decimal(&self.0) {
            if let Ok(n) = self.0.parse::<u128>() {
                if let Some(next) = n.checked_add(1) {
                    return OrderedId(next.to_string());
                }
            }
        }
        OrderedId(carry_up(&self.0))
    }

    /// The largest id strictly smaller than this one. `"0"` and the empty id have
    /// no predecessor and are returned unchanged.
    pub fn decrement(&self) -> OrderedId {
        if is_canonical_decimal(&self.0) {
            if let Ok(n) = self.0.parse::<u128>() {
                return match n.checked_sub(1) {
                    Some(prev) => OrderedId(prev.to_string()),
                    None => self.clone(),
                };
            }
        }
        OrderedId(borrow_down(&self.0))
    }

    /// Length-first comparison, the order every feed is sorted by.
    pub fn compare(a: &str, b: &str) -> Ordering {
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl Ord for OrderedId {
    fn cmp(&self, other: &Self) -> Ordering {
        OrderedId::compare(&self.0, &other.0)
    }
}

impl PartialOrd for OrderedId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OrderedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderedId {
    fn from(s: &str) -> Self {
        OrderedId(s.to_string())
    }
}

impl From<String> for OrderedId {
    fn from(s: String) -> Self {
        OrderedId(s)
    }
}

/// Digits only, without leading zeros ("0" itself included).
fn is_canonical_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

// Digits, upper case, lower case: ascending in ASCII, so carrying keeps the
// lexicographic order intact.
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn digit_range(s: &str) -> &'static [u8] {
    if s.bytes().all(|b| b.is_ascii_digit()) {
        &ALPHABET[..10]
    } else {
        ALPHABET
    }
}

fn carry_up(s: &str) -> String {
    let alphabet = digit_range(s);
    let lowest = alphabet[0];
    let highest = alphabet[alphabet.len() - 1];
    let mut bytes = s.as_bytes().to_vec();

    for i in (0..bytes.len()).rev() {
        if bytes[i] < highest {
            let pos = alphabet.iter().position(|&c| c > bytes[i]).unwrap_or(0);
            bytes[i] = alphabet[pos];
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        bytes[i] = lowest;
    }

    // Every position overflowed: grow by one, e.g. "999" -> "1000".
    let mut grown = Vec::with_capacity(bytes.len() + 1);
    grown.push(alphabet[1]);
    grown.extend(std::iter::repeat(lowest).take(bytes.len()));
    String::from_utf8_lossy(&grown).into_owned()
}

fn borrow_down(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let alphabet = digit_range(s);
    let lowest = alphabet[0];
    let highest = alphabet[alphabet.len() - 1];
    let mut bytes = s.as_bytes().to_vec();

    for i in (0..bytes.len()).rev() {
        if bytes[i] > lowest {
            let pos = alphabet.iter().rposition(|&c| c < bytes[i]).unwrap_or(0);
            bytes[i] = alphabet[pos];
            if bytes[0] == lowest && s.as_bytes()[0] != lowest && bytes.len() > 1 {
                // "1000" -> "0999" -> "999": drop the leading zero so the shorter
                // id still sorts below the original. Padded ids stay padded.
                bytes.remove(0);
            }
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        bytes[i] = highest;
    }

    s.to_string()
}
