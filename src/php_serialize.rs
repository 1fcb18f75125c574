//! Reader for the subset of PHP `serialize()` output stored in Phorum's
//! private message `meta` column.

use thiserror::Error;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum PhpValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<(PhpKey, PhpValue)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhpKey {
    Int(i64),
    Str(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum PhpError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected byte {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("unsupported type tag {0:?}")]
    UnsupportedType(char),
    #[error("invalid number at offset {0}")]
    InvalidNumber(usize),
    #[error("invalid array key at offset {0}")]
    InvalidKey(usize),
    #[error("trailing data at offset {0}")]
    TrailingData(usize),
    #[error("arrays nested deeper than {MAX_DEPTH} levels at offset {0}")]
    TooDeep(usize),
}

impl PhpValue {
    /// Looks up a string key in an array value.
    pub fn get(&self, key: &str) -> Option<&PhpValue> {
        match self {
            PhpValue::Array(entries) => entries.iter().find_map(|(k, v)| match k {
                PhpKey::Str(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    pub fn entries(&self) -> Option<&[(PhpKey, PhpValue)]> {
        match self {
            PhpValue::Array(entries) => Some(entries),
            _ => None,
        }
    }
}

impl PhpKey {
    /// Integer view of the key; numeric string keys are accepted as PHP does.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PhpKey::Int(i) => Some(*i),
            PhpKey::Str(s) => s.trim().parse().ok(),
        }
    }
}

pub fn unserialize(input: &str) -> Result<PhpValue, PhpError> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    if parser.pos != parser.bytes.len() {
        return Err(PhpError::TrailingData(parser.pos));
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn value(&mut self) -> Result<PhpValue, PhpError> {
        let tag = self.next()?;
        match tag {
            b'N' => {
                self.expect(b';')?;
                Ok(PhpValue::Null)
            }
            b'b' => {
                self.expect(b':')?;
                let n = self.int_until(b';')?;
                Ok(PhpValue::Bool(n != 0))
            }
            b'i' => {
                self.expect(b':')?;
                Ok(PhpValue::Int(self.int_until(b';')?))
            }
            b'd' => {
                self.expect(b':')?;
                let start = self.pos;
                let raw = self.take_until(b';')?;
                let f = match raw {
                    "INF" => f64::INFINITY,
                    "-INF" => f64::NEG_INFINITY,
                    "NAN" => f64::NAN,
                    other => other.parse().map_err(|_| PhpError::InvalidNumber(start))?,
                };
                Ok(PhpValue::Float(f))
            }
            b's' => {
                self.expect(b':')?;
                Ok(PhpValue::Str(self.string_body()?))
            }
            b'a' => {
                self.expect(b':')?;
                let len = self.int_until(b':')?;
                let len = usize::try_from(len).map_err(|_| PhpError::InvalidNumber(self.pos))?;
                self.expect(b'{')?;
                if self.depth == MAX_DEPTH {
                    return Err(PhpError::TooDeep(self.pos));
                }
                self.depth += 1;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let key = self.key()?;
                    let value = self.value()?;
                    entries.push((key, value));
                }
                self.depth -= 1;
                self.expect(b'}')?;
                Ok(PhpValue::Array(entries))
            }
            other => Err(PhpError::UnsupportedType(other as char)),
        }
    }

    fn key(&mut self) -> Result<PhpKey, PhpError> {
        let offset = self.pos;
        match self.value()? {
            PhpValue::Int(i) => Ok(PhpKey::Int(i)),
            PhpValue::Str(s) => Ok(PhpKey::Str(s)),
            _ => Err(PhpError::InvalidKey(offset)),
        }
    }

    // `<len>:"<len bytes>";` with the length counted in bytes.
    fn string_body(&mut self) -> Result<String, PhpError> {
        let len = self.int_until(b':')?;
        let len = usize::try_from(len).map_err(|_| PhpError::InvalidNumber(self.pos))?;
        self.expect(b'"')?;
        let end = self.pos.checked_add(len).ok_or(PhpError::UnexpectedEnd)?;
        let raw = self.bytes.get(self.pos..end).ok_or(PhpError::UnexpectedEnd)?;
        let s = String::from_utf8_lossy(raw).into_owned();
        self.pos = end;
        self.expect(b'"')?;
        self.expect(b';')?;
        Ok(s)
    }

    fn int_until(&mut self, terminator: u8) -> Result<i64, PhpError> {
        let start = self.pos;
        let raw = self.take_until(terminator)?;
        raw.parse().map_err(|_| PhpError::InvalidNumber(start))
    }

    fn take_until(&mut self, terminator: u8) -> Result<&str, PhpError> {
        let start = self.pos;
        let rel = self.bytes[start..]
            .iter()
            .position(|b| *b == terminator)
            .ok_or(PhpError::UnexpectedEnd)?;
        self.pos = start + rel + 1;
        std::str::from_utf8(&self.bytes[start..start + rel])
            .map_err(|_| PhpError::InvalidNumber(start))
    }

    fn next(&mut self) -> Result<u8, PhpError> {
        let b = *self.bytes.get(self.pos).ok_or(PhpError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, wanted: u8) -> Result<(), PhpError> {
        let offset = self.pos;
        let found = self.next()?;
        if found == wanted {
            Ok(())
        } else {
            Err(PhpError::Unexpected {
                found: found as char,
                offset,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{unserialize, PhpError, PhpKey, PhpValue, MAX_DEPTH};

    #[test]
    fn parses_phorum_recipient_meta() {
        let meta = concat!(
            r#"a:1:{s:10:"recipients";a:2:{"#,
            r#"i:12;a:2:{s:7:"user_id";s:2:"12";s:8:"username";s:5:"alice";}"#,
            r#"i:40;a:2:{s:7:"user_id";s:2:"40";s:8:"username";s:3:"bob";}}}"#,
        );
        let value = unserialize(meta).expect("valid meta");
        let recipients = value.get("recipients").expect("recipients key");
        let ids: Vec<i64> = recipients
            .entries()
            .expect("array")
            .iter()
            .filter_map(|(k, _)| k.as_int())
            .collect();
        assert_eq!(ids, vec![12, 40]);
    }

    #[test]
    fn string_length_counts_bytes() {
        let value = unserialize("s:5:\"h\u{e9}ll\";").expect("utf-8 string");
        assert_eq!(value, PhpValue::Str("h\u{e9}ll".to_string()));
    }

    #[test]
    fn scalars() {
        assert_eq!(unserialize("N;"), Ok(PhpValue::Null));
        assert_eq!(unserialize("b:1;"), Ok(PhpValue::Bool(true)));
        assert_eq!(unserialize("i:-7;"), Ok(PhpValue::Int(-7)));
        assert_eq!(unserialize("d:0.5;"), Ok(PhpValue::Float(0.5)));
    }

    #[test]
    fn numeric_string_keys_convert_to_ints() {
        assert_eq!(PhpKey::Str("42".to_string()).as_int(), Some(42));
        assert_eq!(PhpKey::Str("bob".to_string()).as_int(), None);
    }

    #[test]
    fn rejects_wrong_string_length() {
        let err = unserialize("s:10:\"short\";").expect_err("length mismatch");
        assert_eq!(err, PhpError::UnexpectedEnd);
    }

    #[test]
    fn rejects_truncated_array() {
        assert!(unserialize("a:2:{i:1;i:2;").is_err());
    }

    #[test]
    fn limits_array_nesting() {
        let nested = |levels: usize| {
            let mut raw = "a:1:{i:0;".repeat(levels);
            raw.push_str("i:1;");
            raw.push_str(&"}".repeat(levels));
            raw
        };
        assert!(unserialize(&nested(MAX_DEPTH)).is_ok());
        assert!(matches!(
            unserialize(&nested(MAX_DEPTH + 1)),
            Err(PhpError::TooDeep(_))
        ));
        // unterminated and far too deep: must fail, not overflow the stack
        let bomb = "a:1:{i:0;".repeat(200_000);
        assert!(matches!(unserialize(&bomb), Err(PhpError::TooDeep(_))));
    }

    #[test]
    fn rejects_objects_and_trailing_data() {
        assert_eq!(
            unserialize("O:8:\"stdClass\":0:{}"),
            Err(PhpError::UnsupportedType('O'))
        );
        assert_eq!(unserialize("i:1;i:2;"), Err(PhpError::TrailingData(4)));
    }
}
