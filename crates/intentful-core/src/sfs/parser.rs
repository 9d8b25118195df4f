// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recursive-descent parser for signature text.

/// A signature failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid signature '{signature}' at position {position}: {message}")]
pub struct SignatureSyntaxError {
    /// The signature text.
    pub signature: String,
    /// Byte offset the parser stopped at.
    pub position: usize,
    /// What was expected.
    pub message: String,
}

/// Parsed form of a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Compare the values at the current position.
    Leaf,
    /// Descend through object fields, then apply `then`.
    Path {
        /// Field names, outermost first.
        fields: Vec<String>,
        /// Selector applied at the end of the path.
        then: Box<Selector>,
    },
    /// Union of the member selectors' differences.
    Group(Vec<Selector>),
    /// Pair array elements by index and apply the inner selector to each pair.
    Vector(Box<Selector>),
    /// Array elements present in spec but not in status, identified by key fields.
    Added(Vec<String>),
    /// Array elements present in status but not in spec, identified by key fields.
    Removed(Vec<String>),
}

/// Parse signature text into a [`Selector`].
pub fn parse(signature: &str) -> Result<Selector, SignatureSyntaxError> {
    let mut parser = Parser {
        src: signature,
        bytes: signature.as_bytes(),
        pos: 0,
    };
    let selector = parser.selector()?;
    parser.skip_ws();
    if parser.pos < parser.bytes.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(selector)
}

fn is_field_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> SignatureSyntaxError {
        SignatureSyntaxError {
            signature: self.src.to_string(),
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    /// Byte after the current one, skipping whitespace.
    fn peek_second(&mut self) -> Option<u8> {
        self.skip_ws();
        let mut i = self.pos + 1;
        while i < self.bytes.len() && self.bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        self.bytes.get(i).copied()
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), SignatureSyntaxError> {
        if self.eat(b) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", b as char)))
        }
    }

    fn at_suffix(&mut self) -> bool {
        match self.peek() {
            Some(b'{') | Some(b'[') | Some(b'+') => true,
            Some(b'-') => self.peek_second() == Some(b'{'),
            _ => false,
        }
    }

    fn field(&mut self) -> Result<String, SignatureSyntaxError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len() && is_field_byte(self.bytes[self.pos]) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a field name"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn selector(&mut self) -> Result<Selector, SignatureSyntaxError> {
        if self.at_suffix() {
            return self.suffix();
        }

        let mut fields = vec![self.field()?];
        let mut then = Selector::Leaf;
        while self.eat(b'.') {
            if self.at_suffix() {
                then = self.suffix()?;
                break;
            }
            fields.push(self.field()?);
        }

        Ok(Selector::Path {
            fields,
            then: Box::new(then),
        })
    }

    fn suffix(&mut self) -> Result<Selector, SignatureSyntaxError> {
        match self.peek() {
            Some(b'{') => {
                self.pos += 1;
                let mut members = vec![self.selector()?];
                while self.eat(b',') {
                    members.push(self.selector()?);
                }
                self.expect(b'}')?;
                Ok(Selector::Group(members))
            }
            Some(b'[') => {
                self.pos += 1;
                let inner = self.selector()?;
                self.expect(b']')?;
                Ok(Selector::Vector(Box::new(inner)))
            }
            Some(b'+') => {
                self.pos += 1;
                Ok(Selector::Added(self.key_list()?))
            }
            Some(b'-') => {
                self.pos += 1;
                Ok(Selector::Removed(self.key_list()?))
            }
            _ => Err(self.error("expected '{', '[', '+{' or '-{'")),
        }
    }

    fn key_list(&mut self) -> Result<Vec<String>, SignatureSyntaxError> {
        self.expect(b'{')?;
        let mut keys = vec![self.field()?];
        while self.eat(b',') {
            keys.push(self.field()?);
        }
        self.expect(b'}')?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(fields: &[&str], then: Selector) -> Selector {
        Selector::Path {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            then: Box::new(then),
        }
    }

    #[test]
    fn test_parse_simple_and_dotted_paths() {
        assert_eq!(parse("x").unwrap(), path(&["x"], Selector::Leaf));
        assert_eq!(
            parse("spec_a.inner-b.c").unwrap(),
            path(&["spec_a", "inner-b", "c"], Selector::Leaf)
        );
    }

    #[test]
    fn test_parse_group_vector_and_keyed_sets() {
        assert_eq!(
            parse("{x, y}").unwrap(),
            Selector::Group(vec![path(&["x"], Selector::Leaf), path(&["y"], Selector::Leaf)])
        );
        assert_eq!(
            parse("hosts.[ip]").unwrap(),
            path(
                &["hosts"],
                Selector::Vector(Box::new(path(&["ip"], Selector::Leaf)))
            )
        );
        assert_eq!(
            parse("objects.+{name}").unwrap(),
            path(&["objects"], Selector::Added(vec!["name".to_string()]))
        );
        assert_eq!(
            parse("objects.-{name, zone}").unwrap(),
            path(
                &["objects"],
                Selector::Removed(vec!["name".to_string(), "zone".to_string()])
            )
        );
    }

    #[test]
    fn test_parse_errors_report_position() {
        let err = parse("").unwrap_err();
        assert_eq!(err.position, 0);

        let err = parse("x.").unwrap_err();
        assert_eq!(err.position, 2);
        assert_eq!(err.message, "expected a field name");

        let err = parse("{x, y").unwrap_err();
        assert_eq!(err.message, "expected '}'");

        let err = parse("x y").unwrap_err();
        assert_eq!(err.message, "unexpected trailing input");

        assert!(parse("objects.+name").is_err());
        assert!(parse("a.$b").is_err());
    }
}
