//! Final-result payload decoding.
//!
//! 現行の producer は常に `{schema_version, result}` を送るので、その経路は strict parse 1 本だけ。
//! schema_version の無い payload は旧 producer 由来として legacy decoder に回します。
//!
//! # legacy decoder の段階
//! 1. strict JSON
//! 2. literal parse（single quote 文字列、`True` / `False` / `None`、tuple、末尾カンマ）
//! 3. token 置換（`'` → `"`、`True` → `true` など）してから JSON
//!
//! どの段階で読めたかは必ずログに残します。

use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::domain::events::RESULT_SCHEMA_VERSION;
use crate::domain::{EventPayload, ResultEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeLayer {
    Versioned,
    LegacyJson,
    LegacyLiteral,
    LegacyTokens,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: Value,
    pub layer: DecodeLayer,
}

/// The `result` value for the terminal frame, or `None` when unusable.
pub fn decode_result(payload: Option<&EventPayload>) -> Option<Decoded> {
    let decoded = match payload? {
        EventPayload::Json(value) => match versioned(value) {
            Some(result) => result,
            None => Some(Decoded {
                value: value.clone(),
                layer: DecodeLayer::LegacyJson,
            }),
        },
        EventPayload::Text(text) => legacy(text),
    };
    match &decoded {
        Some(d) if d.layer == DecodeLayer::Versioned => debug!("result payload decoded"),
        Some(d) => warn!(layer = ?d.layer, "legacy result payload decoded"),
        None => warn!("result payload could not be decoded"),
    }
    decoded
}

/// `Some(..)` when the value claims a schema version; the inner option is the parse result.
fn versioned(value: &Value) -> Option<Option<Decoded>> {
    let version = value.get("schema_version")?;
    if version.as_u64() != Some(u64::from(RESULT_SCHEMA_VERSION)) {
        warn!(%version, "unsupported result schema version");
        return Some(None);
    }
    let parsed = match serde_json::from_value::<ResultEnvelope>(value.clone()) {
        Ok(envelope) => serde_json::to_value(envelope.result).ok(),
        Err(e) => {
            warn!(error = %e, "versioned result payload does not match its schema");
            None
        }
    };
    Some(parsed.map(|value| Decoded {
        value,
        layer: DecodeLayer::Versioned,
    }))
}

fn legacy(text: &str) -> Option<Decoded> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        // stringified envelope from a current producer still takes the strict path
        if let Some(result) = versioned(&value) {
            return result;
        }
        return Some(Decoded {
            value,
            layer: DecodeLayer::LegacyJson,
        });
    }
    if let Some(value) = LiteralParser::new(text).parse() {
        return Some(Decoded {
            value,
            layer: DecodeLayer::LegacyLiteral,
        });
    }
    let substituted = text
        .replace('\'', "\"")
        .replace("True", "true")
        .replace("False", "false")
        .replace("None", "null");
    serde_json::from_str::<Value>(&substituted)
        .ok()
        .map(|value| Decoded {
            value,
            layer: DecodeLayer::LegacyTokens,
        })
}

/// Recursive-descent parser for repr-style literals.
struct LiteralParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn parse(mut self) -> Option<Value> {
        let value = self.value()?;
        self.skip_ws();
        (self.pos == self.src.len()).then_some(value)
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '{' => self.dict(),
            '[' => self.sequence('[', ']'),
            '(' => self.sequence('(', ')'),
            '\'' | '"' => self.string().map(Value::String),
            c if c == '-' || c.is_ascii_digit() => self.number(),
            _ => self.keyword(),
        }
    }

    fn dict(&mut self) -> Option<Value> {
        self.bump();
        let mut map = Map::new();
        loop {
            if self.eat('}') {
                return Some(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            if !self.eat(':') {
                return None;
            }
            let value = self.value()?;
            map.insert(key, value);
            if !self.eat(',') {
                return self.eat('}').then_some(Value::Object(map));
            }
        }
    }

    fn sequence(&mut self, open: char, close: char) -> Option<Value> {
        debug_assert_eq!(self.peek(), Some(open));
        self.bump();
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Some(Value::Array(items));
            }
            items.push(self.value()?);
            if !self.eat(',') {
                return self.eat(close).then_some(Value::Array(items));
            }
        }
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                c if c == quote => return Some(out),
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    other => out.push(other),
                },
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        {
            self.bump();
        }
        let text = &self.src[start..self.pos];
        if let Ok(n) = text.parse::<i64>() {
            return Some(Value::Number(n.into()));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    }

    fn keyword(&mut self) -> Option<Value> {
        let rest = &self.src[self.pos..];
        let (word, value) = [("True", Value::Bool(true)), ("False", Value::Bool(false)), ("None", Value::Null)]
            .into_iter()
            .find(|(word, _)| rest.starts_with(word))?;
        self.pos += word.len();
        Some(value)
    }
}
