//! Dotted path parsing.
//!
//! A path is a sequence of segments: identifiers, optionally followed by
//! bracket indices. Brackets accept an unsigned integer (`items[0]`) or a
//! quoted string for keys containing `.` or other special characters
//! (`headers["content.type"]`).

use std::fmt;

use crate::error::ExpressionError;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A bare identifier (`result`).
    Field(String),
    /// A numeric array index (`[0]`).
    Index(usize),
    /// A quoted object key (`["content.type"]`).
    Key(String),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => write!(f, "[{k:?}]"),
        }
    }
}

/// A parsed dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    /// Parse a path from its textual form.
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let bytes = input.as_bytes();
        let mut pos = 0;

        loop {
            let start = pos;
            while pos < bytes.len() && is_ident_byte(bytes[pos]) {
                pos += 1;
            }
            if pos == start {
                return Err(ExpressionError::parse(pos, "expected identifier"));
            }
            segments.push(Segment::Field(input[start..pos].to_owned()));

            // Zero or more bracket suffixes on this segment.
            while pos < bytes.len() && bytes[pos] == b'[' {
                pos += 1;
                if pos >= bytes.len() {
                    return Err(ExpressionError::parse(pos, "unterminated index"));
                }
                if bytes[pos] == b'"' || bytes[pos] == b'\'' {
                    let quote = bytes[pos];
                    pos += 1;
                    let key_start = pos;
                    while pos < bytes.len() && bytes[pos] != quote {
                        pos += 1;
                    }
                    if pos >= bytes.len() {
                        return Err(ExpressionError::parse(pos, "unterminated quoted key"));
                    }
                    segments.push(Segment::Key(input[key_start..pos].to_owned()));
                    pos += 1; // closing quote
                } else {
                    let num_start = pos;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                    if pos == num_start {
                        return Err(ExpressionError::parse(pos, "expected integer or quoted key"));
                    }
                    let index: usize = input[num_start..pos]
                        .parse()
                        .map_err(|_| ExpressionError::parse(num_start, "index out of range"))?;
                    segments.push(Segment::Index(index));
                }
                if pos >= bytes.len() || bytes[pos] != b']' {
                    return Err(ExpressionError::parse(pos, "expected closing bracket"));
                }
                pos += 1;
            }

            if pos >= bytes.len() {
                break;
            }
            if bytes[pos] != b'.' {
                return Err(ExpressionError::parse(
                    pos,
                    format!("unexpected character {:?}", input[pos..].chars().next()),
                ));
            }
            pos += 1;
        }

        Ok(Self { segments })
    }

    /// The parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The leading identifier (the namespace or step id).
    #[must_use]
    pub fn head(&self) -> &str {
        match &self.segments[0] {
            Segment::Field(name) => name,
            // Parsing guarantees the path starts with an identifier.
            Segment::Index(_) | Segment::Key(_) => unreachable!("path starts with identifier"),
        }
    }

    /// The segments after the head.
    #[must_use]
    pub fn tail(&self) -> &[Segment] {
        &self.segments[1..]
    }

    /// Walk `value` along the given segments, returning `None` on any miss.
    #[must_use]
    pub fn walk<'v>(
        value: &'v serde_json::Value,
        segments: &[Segment],
    ) -> Option<&'v serde_json::Value> {
        let mut current = value;
        for segment in segments {
            current = match segment {
                Segment::Field(name) => current.get(name.as_str())?,
                Segment::Key(key) => current.get(key.as_str())?,
                Segment::Index(i) => current.get(*i)?,
            };
        }
        Some(current)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 && matches!(segment, Segment::Field(_)) {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}
