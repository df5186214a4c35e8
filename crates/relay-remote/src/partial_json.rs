//! Best-effort parsing of JSON text that may be cut off at any byte, as
//! produced by a model streaming tool-call arguments.

use serde_json::{Map, Value};

/// Parses `text`, completing whatever was cut off.
///
/// Unterminated strings are closed, truncated `true`/`false`/`null` literals
/// are completed, numbers are cut back to their longest valid prefix, and
/// dangling commas, colons and keys without a value are dropped before open
/// containers are closed. Only truncation is repaired: text with a syntax
/// error, or with anything but whitespace after the value, yields `None`.
pub fn parse_partial_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    let mut parser = Parser {
        bytes: text.as_bytes(),
        pos: 0,
    };
    match parser.parse_value().ok()? {
        Parsed::Truncated(value) => value,
        Parsed::Complete(value) => {
            parser.skip_ws();
            parser.at_end().then_some(value)
        }
    }
}

enum Parsed {
    Complete(Value),
    /// Input ended inside the value; holds its best completion, if any.
    Truncated(Option<Value>),
}

/// `Err` holds the byte offset of the first syntax error.
type ParseResult = Result<Parsed, usize>;

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> ParseResult {
        self.skip_ws();
        match self.peek() {
            None => Ok(Parsed::Truncated(None)),
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => self.parse_string().map(|parsed| match parsed {
                StringPart::Complete(s) => Parsed::Complete(Value::String(s)),
                StringPart::Truncated(s) => Parsed::Truncated(Some(Value::String(s))),
            }),
            Some(b't') => self.parse_literal("true", Value::Bool(true)),
            Some(b'f') => self.parse_literal("false", Value::Bool(false)),
            Some(b'n') => self.parse_literal("null", Value::Null),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(_) => Err(self.pos),
        }
    }

    fn parse_object(&mut self) -> ParseResult {
        self.pos += 1;
        let mut map = Map::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Parsed::Complete(Value::Object(map)));
        }
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Ok(Parsed::Truncated(Some(Value::Object(map)))),
                Some(b'"') => {}
                Some(_) => return Err(self.pos),
            }
            let key = match self.parse_string()? {
                StringPart::Complete(key) => key,
                StringPart::Truncated(_) => return Ok(Parsed::Truncated(Some(Value::Object(map)))),
            };
            self.skip_ws();
            match self.peek() {
                None => return Ok(Parsed::Truncated(Some(Value::Object(map)))),
                Some(b':') => self.pos += 1,
                Some(_) => return Err(self.pos),
            }
            match self.parse_value()? {
                Parsed::Complete(value) => {
                    map.insert(key, value);
                }
                Parsed::Truncated(value) => {
                    if let Some(value) = value {
                        map.insert(key, value);
                    }
                    return Ok(Parsed::Truncated(Some(Value::Object(map))));
                }
            }
            self.skip_ws();
            match self.peek() {
                None => return Ok(Parsed::Truncated(Some(Value::Object(map)))),
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Parsed::Complete(Value::Object(map)));
                }
                Some(_) => return Err(self.pos),
            }
        }
    }

    fn parse_array(&mut self) -> ParseResult {
        self.pos += 1;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Parsed::Complete(Value::Array(items)));
        }
        loop {
            match self.parse_value()? {
                Parsed::Complete(value) => items.push(value),
                Parsed::Truncated(value) => {
                    items.extend(value);
                    return Ok(Parsed::Truncated(Some(Value::Array(items))));
                }
            }
            self.skip_ws();
            match self.peek() {
                None => return Ok(Parsed::Truncated(Some(Value::Array(items)))),
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Parsed::Complete(Value::Array(items)));
                }
                Some(_) => return Err(self.pos),
            }
        }
    }

    fn parse_string(&mut self) -> Result<StringPart, usize> {
        self.pos += 1;
        let mut out: Vec<u8> = Vec::new();
        loop {
            let Some(byte) = self.peek() else {
                return Ok(StringPart::Truncated(into_string(out)));
            };
            match byte {
                b'"' => {
                    self.pos += 1;
                    return Ok(StringPart::Complete(into_string(out)));
                }
                b'\\' => {
                    let escape_at = self.pos;
                    let Some(next) = self.bytes.get(self.pos + 1).copied() else {
                        self.pos = self.bytes.len();
                        return Ok(StringPart::Truncated(into_string(out)));
                    };
                    let simple = match next {
                        b'"' => Some(b'"'),
                        b'\\' => Some(b'\\'),
                        b'/' => Some(b'/'),
                        b'b' => Some(0x08),
                        b'f' => Some(0x0c),
                        b'n' => Some(b'\n'),
                        b'r' => Some(b'\r'),
                        b't' => Some(b'\t'),
                        b'u' => None,
                        _ => return Err(escape_at),
                    };
                    if let Some(simple) = simple {
                        out.push(simple);
                        self.pos += 2;
                        continue;
                    }
                    match self.parse_unicode_escape()? {
                        Some(ch) => {
                            let mut buf = [0u8; 4];
                            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                        }
                        None => {
                            self.pos = self.bytes.len();
                            return Ok(StringPart::Truncated(into_string(out)));
                        }
                    }
                }
                _ => {
                    out.push(byte);
                    self.pos += 1;
                }
            }
        }
    }

    /// Parses `\uXXXX` (and a following low surrogate) at `pos`. `None` means
    /// the input ended inside the escape.
    fn parse_unicode_escape(&mut self) -> Result<Option<char>, usize> {
        let start = self.pos;
        let Some(high) = self.hex4(start + 2)? else {
            return Ok(None);
        };
        self.pos = start + 6;
        if !(0xD800..0xDC00).contains(&high) {
            return Ok(Some(char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER)));
        }
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        if rest.is_empty() || rest == b"\\" || (rest.len() >= 2 && &rest[..2] == b"\\u" && rest.len() < 6) {
            return Ok(None);
        }
        if rest.len() >= 6 && &rest[..2] == b"\\u" {
            if let Some(low) = self.hex4(self.pos + 2)? {
                if (0xDC00..0xE000).contains(&low) {
                    self.pos += 6;
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    return Ok(Some(char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER)));
                }
            }
        }
        Ok(Some(char::REPLACEMENT_CHARACTER))
    }

    fn hex4(&self, at: usize) -> Result<Option<u32>, usize> {
        let mut code = 0u32;
        for offset in 0..4 {
            let Some(byte) = self.bytes.get(at + offset).copied() else {
                return Ok(None);
            };
            let digit = (byte as char).to_digit(16).ok_or(at + offset)?;
            code = code * 16 + digit;
        }
        Ok(Some(code))
    }

    fn parse_literal(&mut self, word: &str, value: Value) -> ParseResult {
        let word = word.as_bytes();
        let available = &self.bytes[self.pos..];
        let len = available.len().min(word.len());
        if let Some(mismatch) = (0..len).find(|&i| available[i] != word[i]) {
            return Err(self.pos + mismatch);
        }
        self.pos += len;
        if len < word.len() {
            return Ok(Parsed::Truncated(Some(value)));
        }
        Ok(Parsed::Complete(value))
    }

    fn parse_number(&mut self) -> ParseResult {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9')
        ) {
            self.pos += 1;
        }
        // only ASCII bytes were consumed, so the slice is valid UTF-8
        let raw = std::str::from_utf8(&self.bytes[start..self.pos]).map_err(|_| start)?;
        if !self.at_end() {
            return match serde_json::from_str::<Value>(raw) {
                Ok(value) if value.is_number() => Ok(Parsed::Complete(value)),
                _ => Err(start),
            };
        }
        let longest = (1..=raw.len())
            .rev()
            .find_map(|end| match serde_json::from_str::<Value>(&raw[..end]) {
                Ok(value) if value.is_number() => Some(value),
                _ => None,
            });
        Ok(Parsed::Truncated(longest))
    }
}

enum StringPart {
    Complete(String),
    Truncated(String),
}

fn into_string(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}
