//! Object identities and their stringified form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::{Decode, Encode, InputStream, OutputStream};
use crate::error::{Error, Result};

/// Name and category addressing one servant inside an adapter.
///
/// Equality and hashing are structural. The stringified form is
/// `category/name` (or just `name` when the category is empty), with `/`,
/// `\`, quotes and control characters escaped by a backslash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    /// Servant name; must not be empty for dispatch.
    pub name: String,
    /// Optional category, used for default servants and servant locators.
    pub category: String,
}

impl Identity {
    /// Creates an identity with an empty category.
    pub fn new(name: impl Into<String>) -> Self {
        Identity {
            name: name.into(),
            category: String::new(),
        }
    }

    /// Creates an identity with a category.
    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Identity {
            name: name.into(),
            category: category.into(),
        }
    }

    /// The null identity marks a null proxy on the wire.
    pub fn is_null(&self) -> bool {
        self.name.is_empty() && self.category.is_empty()
    }

    /// Identity with a random UUID name.
    pub fn random() -> Self {
        Identity::new(uuid::Uuid::new_v4().to_string())
    }
}

impl Encode for Identity {
    fn encode(&self, out: &mut OutputStream) {
        out.write_string(&self.name);
        out.write_string(&self.category);
    }
}

impl Decode for Identity {
    const MIN_WIRE_SIZE: usize = 2;

    fn decode(input: &mut InputStream) -> Result<Self> {
        let name = input.read_string()?;
        let category = input.read_string()?;
        Ok(Identity { name, category })
    }
}

fn escape(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\{:03o}", c as u32));
            }
            c => out.push(c),
        }
    }
}

fn unescape(input: &str, whole: &str) -> Result<String> {
    let parse_error = |reason: &str| Error::IdentityParse {
        input: whole.to_string(),
        reason: reason.to_string(),
    };
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let next = chars.next().ok_or_else(|| parse_error("trailing backslash"))?;
        match next {
            '\\' | '/' | '\'' | '"' | '?' => out.push(next),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            '0'..='7' => {
                let mut value = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                let decoded =
                    char::from_u32(value).ok_or_else(|| parse_error("invalid octal escape"))?;
                out.push(decoded);
            }
            _ => return Err(parse_error("invalid escape sequence")),
        }
    }
    Ok(out)
}

/// Finds the first `/` not preceded by an escaping backslash.
fn find_separator(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '/' {
            return Some(i);
        }
    }
    None
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if !self.category.is_empty() {
            escape(&self.category, &mut out);
            out.push('/');
        }
        escape(&self.name, &mut out);
        f.write_str(&out)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match find_separator(s) {
            None => Ok(Identity::new(unescape(s, s)?)),
            Some(slash) => {
                let (category, rest) = s.split_at(slash);
                let name = &rest[1..];
                if find_separator(name).is_some() {
                    return Err(Error::IdentityParse {
                        input: s.to_string(),
                        reason: "unescaped `/` in name".to_string(),
                    });
                }
                let name = unescape(name, s)?;
                if name.is_empty() {
                    return Err(Error::IdentityParse {
                        input: s.to_string(),
                        reason: "empty name".to_string(),
                    });
                }
                Ok(Identity::with_category(name, unescape(category, s)?))
            }
        }
    }
}
