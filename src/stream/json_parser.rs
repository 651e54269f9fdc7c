//! Incremental JSON value parser for streamed completions
//!
//! Text fragments are fed in arrival order. Whenever a value nested inside the
//! document closes, it is handed to the callback synchronously, even though the
//! enclosing document is still open. Fragment boundaries may fall anywhere,
//! including inside strings, escapes, numbers and literals.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace};

use crate::stream::path::{format_path, PathSegment, PathSelector};

/// Errors produced by the streaming parser
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JsonStreamError {
    /// A character that cannot continue any valid JSON prefix
    #[error("malformed JSON at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    /// Input ended while a value was still open
    #[error("incomplete JSON: input ended inside an open value (depth {depth})")]
    Incomplete { depth: usize },

    /// A path selector that could not be parsed
    #[error("invalid path selector: {0}")]
    InvalidSelector(String),
}

impl JsonStreamError {
    /// Whether more input could have completed the document
    pub fn is_incomplete(&self) -> bool {
        matches!(self, JsonStreamError::Incomplete { .. })
    }
}

/// A value recognized as complete before the document finished streaming
#[derive(Clone, Debug, PartialEq)]
pub struct StreamedValue {
    /// Location of the value from the document root
    pub path: Vec<PathSegment>,

    /// The parsed value
    pub value: Value,
}

impl StreamedValue {
    /// The key or index locating this value in its direct parent
    pub fn key(&self) -> Option<&PathSegment> {
        self.path.last()
    }

    /// Array index of this value, if its parent is an array
    pub fn index(&self) -> Option<usize> {
        match self.key() {
            Some(PathSegment::Index(index)) => Some(*index),
            _ => None,
        }
    }

    /// Object key of this value, if its parent is an object
    pub fn object_key(&self) -> Option<&str> {
        match self.key() {
            Some(PathSegment::Key(key)) => Some(key),
            _ => None,
        }
    }

    /// Nesting depth (0 for the root)
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Path rendered as `$.a[0].b`
    pub fn path_string(&self) -> String {
        format_path(&self.path)
    }
}

/// Callback receiving each emitted value
pub type ValueCallback = Box<dyn FnMut(StreamedValue) + Send>;

/// Options controlling which values are emitted
#[derive(Clone, Debug)]
pub struct ParserOptions {
    /// Selectors for emitted values; empty means every value below the root
    pub paths: Vec<PathSelector>,

    /// Whether emitted values are also kept inside their parent container
    pub keep_stack: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            keep_stack: true,
        }
    }
}

impl ParserOptions {
    /// Restrict emission to values matching any of the given selectors
    pub fn with_paths<'a>(
        mut self,
        selectors: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, JsonStreamError> {
        self.paths = selectors
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self)
    }

    /// Set whether emitted values stay in their parent
    pub fn with_keep_stack(mut self, keep_stack: bool) -> Self {
        self.keep_stack = keep_stack;
        self
    }
}

/// Lifecycle of the parser
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParserStatus {
    /// Accepting fragments
    Streaming,
    /// `end()` completed successfully
    Ended,
    /// Stopped on an error; further input is ignored
    Failed(JsonStreamError),
}

#[derive(Debug)]
enum Frame {
    Object {
        map: Map<String, Value>,
        key: Option<String>,
    },
    Array {
        items: Vec<Value>,
        next_index: usize,
    },
}

#[derive(Debug)]
enum Escape {
    None,
    Backslash,
    Unicode(String),
}

#[derive(Debug)]
struct StringLex {
    buf: String,
    is_key: bool,
    escape: Escape,
    high_surrogate: Option<u32>,
}

impl StringLex {
    fn new(is_key: bool) -> Self {
        Self {
            buf: String::new(),
            is_key,
            escape: Escape::None,
            high_surrogate: None,
        }
    }
}

#[derive(Debug)]
enum Lex {
    Value,
    ValueOrArrayEnd,
    KeyOrObjectEnd,
    Key,
    Colon,
    CommaOrEnd,
    Done,
    Str(StringLex),
    Number(String),
    Literal { text: &'static str, matched: usize },
}

enum Step {
    Consumed,
    Reprocess,
}

/// Streaming parser emitting nested values as they close
pub struct StreamingJsonParser {
    options: ParserOptions,
    on_value: ValueCallback,
    stack: Vec<Frame>,
    lex: Lex,
    status: ParserStatus,
    offset: usize,
    emitted: usize,
}

impl StreamingJsonParser {
    /// Create a parser emitting every value below the root
    pub fn new(on_value: ValueCallback) -> Self {
        Self::with_options(ParserOptions::default(), on_value)
    }

    /// Create a parser with explicit options
    pub fn with_options(options: ParserOptions, on_value: ValueCallback) -> Self {
        Self {
            options,
            on_value,
            stack: Vec::new(),
            lex: Lex::Value,
            status: ParserStatus::Streaming,
            offset: 0,
            emitted: 0,
        }
    }

    /// Feed the next fragment
    ///
    /// Never fails: malformed input moves the parser to `Failed` and every
    /// later fragment is ignored.
    pub fn write(&mut self, fragment: &str) {
        if self.status != ParserStatus::Streaming {
            trace!(len = fragment.len(), "ignoring fragment after parser stopped");
            return;
        }

        for c in fragment.chars() {
            if let Err(err) = self.feed_char(c) {
                debug!(error = %err, "JSON stream stopped");
                self.stack.clear();
                self.status = ParserStatus::Failed(err);
                return;
            }
            self.offset += 1;
        }
    }

    /// Signal the end of input
    ///
    /// Completes a trailing root number and reports a document that is still
    /// open as `Incomplete`. Calling `end()` again is a no-op.
    pub fn end(&mut self) -> Result<(), JsonStreamError> {
        match &self.status {
            ParserStatus::Failed(err) => return Err(err.clone()),
            ParserStatus::Ended => return Ok(()),
            ParserStatus::Streaming => {}
        }

        let lex = std::mem::replace(&mut self.lex, Lex::Done);
        let result = match lex {
            Lex::Done => Ok(()),
            Lex::Number(buf) if self.stack.is_empty() => {
                self.parse_number(&buf).map(|value| self.complete_value(value))
            }
            _ => Err(JsonStreamError::Incomplete {
                depth: self.stack.len(),
            }),
        };

        self.stack.clear();
        self.status = match &result {
            Ok(()) => ParserStatus::Ended,
            Err(err) => ParserStatus::Failed(err.clone()),
        };
        result
    }

    /// Current lifecycle status
    pub fn status(&self) -> &ParserStatus {
        &self.status
    }

    /// Whether the parser stopped on an error
    pub fn is_failed(&self) -> bool {
        matches!(self.status, ParserStatus::Failed(_))
    }

    /// Number of values emitted so far
    pub fn emitted_count(&self) -> usize {
        self.emitted
    }

    fn feed_char(&mut self, c: char) -> Result<(), JsonStreamError> {
        loop {
            match self.step(c)? {
                Step::Consumed => return Ok(()),
                Step::Reprocess => continue,
            }
        }
    }

    fn step(&mut self, c: char) -> Result<Step, JsonStreamError> {
        let lex = std::mem::replace(&mut self.lex, Lex::Done);
        match lex {
            Lex::Str(s) => self.step_string(s, c),
            Lex::Number(buf) => self.step_number(buf, c),
            Lex::Literal { text, matched } => self.step_literal(text, matched, c),
            other if is_json_whitespace(c) => {
                self.lex = other;
                Ok(Step::Consumed)
            }
            Lex::Value => self.begin_value(c),
            Lex::ValueOrArrayEnd if c == ']' => self.close_container(c),
            Lex::ValueOrArrayEnd => self.begin_value(c),
            Lex::KeyOrObjectEnd if c == '}' => self.close_container(c),
            Lex::KeyOrObjectEnd | Lex::Key if c == '"' => {
                self.lex = Lex::Str(StringLex::new(true));
                Ok(Step::Consumed)
            }
            Lex::KeyOrObjectEnd | Lex::Key => Err(self.unexpected(c, "an object key")),
            Lex::Colon if c == ':' => {
                self.lex = Lex::Value;
                Ok(Step::Consumed)
            }
            Lex::Colon => Err(self.unexpected(c, "':'")),
            Lex::CommaOrEnd => self.after_value(c),
            Lex::Done => Err(self.unexpected(c, "end of input")),
        }
    }

    fn begin_value(&mut self, c: char) -> Result<Step, JsonStreamError> {
        self.lex = match c {
            '{' => {
                self.stack.push(Frame::Object {
                    map: Map::new(),
                    key: None,
                });
                Lex::KeyOrObjectEnd
            }
            '[' => {
                self.stack.push(Frame::Array {
                    items: Vec::new(),
                    next_index: 0,
                });
                Lex::ValueOrArrayEnd
            }
            '"' => Lex::Str(StringLex::new(false)),
            '-' | '0'..='9' => Lex::Number(c.to_string()),
            't' => Lex::Literal {
                text: "true",
                matched: 1,
            },
            'f' => Lex::Literal {
                text: "false",
                matched: 1,
            },
            'n' => Lex::Literal {
                text: "null",
                matched: 1,
            },
            _ => return Err(self.unexpected(c, "a value")),
        };
        Ok(Step::Consumed)
    }

    fn after_value(&mut self, c: char) -> Result<Step, JsonStreamError> {
        match (c, self.stack.last()) {
            (',', Some(Frame::Object { .. })) => {
                self.lex = Lex::Key;
                Ok(Step::Consumed)
            }
            (',', Some(Frame::Array { .. })) => {
                self.lex = Lex::Value;
                Ok(Step::Consumed)
            }
            ('}', Some(Frame::Object { .. })) | (']', Some(Frame::Array { .. })) => {
                self.close_container(c)
            }
            _ => Err(self.unexpected(c, "',' or a closing bracket")),
        }
    }

    fn close_container(&mut self, c: char) -> Result<Step, JsonStreamError> {
        let value = match self.stack.pop() {
            Some(Frame::Object { map, .. }) => Value::Object(map),
            Some(Frame::Array { items, .. }) => Value::Array(items),
            None => return Err(self.unexpected(c, "a value")),
        };
        self.complete_value(value);
        Ok(Step::Consumed)
    }

    fn step_string(&mut self, mut s: StringLex, c: char) -> Result<Step, JsonStreamError> {
        let escape = std::mem::replace(&mut s.escape, Escape::None);
        match escape {
            Escape::None => match c {
                '"' if s.high_surrogate.is_some() => {
                    return Err(self.malformed("unpaired surrogate in \\u escape"));
                }
                '"' => {
                    self.finish_string(s)?;
                    return Ok(Step::Consumed);
                }
                '\\' => s.escape = Escape::Backslash,
                _ if s.high_surrogate.is_some() => {
                    return Err(self.malformed("unpaired surrogate in \\u escape"));
                }
                c if (c as u32) < 0x20 => {
                    return Err(self.unexpected(c, "an escaped control character"));
                }
                c => s.buf.push(c),
            },
            Escape::Backslash => {
                let decoded = match c {
                    'u' => {
                        s.escape = Escape::Unicode(String::with_capacity(4));
                        self.lex = Lex::Str(s);
                        return Ok(Step::Consumed);
                    }
                    _ if s.high_surrogate.is_some() => {
                        return Err(self.malformed("unpaired surrogate in \\u escape"));
                    }
                    '"' => '"',
                    '\\' => '\\',
                    '/' => '/',
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => return Err(self.unexpected(other, "a valid escape character")),
                };
                s.buf.push(decoded);
            }
            Escape::Unicode(mut digits) => {
                if !c.is_ascii_hexdigit() {
                    return Err(self.unexpected(c, "a hex digit"));
                }
                digits.push(c);
                if digits.len() < 4 {
                    s.escape = Escape::Unicode(digits);
                } else {
                    let code = u32::from_str_radix(&digits, 16)
                        .map_err(|e| self.malformed(&e.to_string()))?;
                    self.push_code_unit(&mut s, code)?;
                }
            }
        }

        self.lex = Lex::Str(s);
        Ok(Step::Consumed)
    }

    fn push_code_unit(&self, s: &mut StringLex, code: u32) -> Result<(), JsonStreamError> {
        let decoded = match (s.high_surrogate.take(), code) {
            (None, 0xD800..=0xDBFF) => {
                s.high_surrogate = Some(code);
                return Ok(());
            }
            (Some(high), 0xDC00..=0xDFFF) => 0x10000 + ((high - 0xD800) << 10) + (code - 0xDC00),
            (Some(_), _) | (None, 0xDC00..=0xDFFF) => {
                return Err(self.malformed("unpaired surrogate in \\u escape"));
            }
            (None, code) => code,
        };

        let ch = char::from_u32(decoded).ok_or_else(|| self.malformed("invalid code point"))?;
        s.buf.push(ch);
        Ok(())
    }

    fn finish_string(&mut self, s: StringLex) -> Result<(), JsonStreamError> {
        if !s.is_key {
            self.complete_value(Value::String(s.buf));
            return Ok(());
        }

        match self.stack.last_mut() {
            Some(Frame::Object { key, .. }) => {
                *key = Some(s.buf);
                self.lex = Lex::Colon;
                Ok(())
            }
            _ => Err(self.malformed("object key outside of an object")),
        }
    }

    fn step_number(&mut self, mut buf: String, c: char) -> Result<Step, JsonStreamError> {
        if matches!(c, '0'..='9' | '-' | '+' | '.' | 'e' | 'E') {
            buf.push(c);
            if !is_json_number_prefix(&buf) {
                return Err(self.malformed(&format!("invalid number `{}`", buf)));
            }
            self.lex = Lex::Number(buf);
            return Ok(Step::Consumed);
        }

        let value = self.parse_number(&buf)?;
        self.complete_value(value);
        Ok(Step::Reprocess)
    }

    fn parse_number(&self, buf: &str) -> Result<Value, JsonStreamError> {
        if !is_json_number(buf) {
            return Err(self.malformed(&format!("invalid number `{}`", buf)));
        }

        match serde_json::from_str::<Value>(buf) {
            Ok(value @ Value::Number(_)) => Ok(value),
            Ok(_) => Err(self.malformed(&format!("invalid number `{}`", buf))),
            Err(e) => Err(self.malformed(&format!("invalid number `{}`: {}", buf, e))),
        }
    }

    fn step_literal(
        &mut self,
        text: &'static str,
        matched: usize,
        c: char,
    ) -> Result<Step, JsonStreamError> {
        let expected = text.as_bytes()[matched] as char;
        if c != expected {
            return Err(self.unexpected(c, &format!("`{}`", text)));
        }

        let matched = matched + 1;
        if matched < text.len() {
            self.lex = Lex::Literal { text, matched };
            return Ok(Step::Consumed);
        }

        let value = match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Null,
        };
        self.complete_value(value);
        Ok(Step::Consumed)
    }

    fn complete_value(&mut self, value: Value) {
        let path = self.current_path();

        let retained = if self.is_selected(&path) {
            self.emitted += 1;
            trace!(path = %format_path(&path), "emitting streamed value");
            if self.options.keep_stack {
                (self.on_value)(StreamedValue {
                    path,
                    value: value.clone(),
                });
                Some(value)
            } else {
                (self.on_value)(StreamedValue { path, value });
                None
            }
        } else {
            Some(value)
        };

        self.lex = match self.stack.last_mut() {
            None => Lex::Done,
            Some(Frame::Object { map, key }) => {
                if let (Some(key), Some(value)) = (key.take(), retained) {
                    map.insert(key, value);
                }
                Lex::CommaOrEnd
            }
            Some(Frame::Array { items, next_index }) => {
                if let Some(value) = retained {
                    items.push(value);
                }
                *next_index += 1;
                Lex::CommaOrEnd
            }
        };
    }

    fn current_path(&self) -> Vec<PathSegment> {
        self.stack
            .iter()
            .map(|frame| match frame {
                Frame::Object { key, .. } => PathSegment::Key(key.clone().unwrap_or_default()),
                Frame::Array { next_index, .. } => PathSegment::Index(*next_index),
            })
            .collect()
    }

    fn is_selected(&self, path: &[PathSegment]) -> bool {
        if self.options.paths.is_empty() {
            return !path.is_empty();
        }
        self.options.paths.iter().any(|selector| selector.matches(path))
    }

    fn malformed(&self, reason: &str) -> JsonStreamError {
        JsonStreamError::Malformed {
            offset: self.offset,
            reason: reason.to_string(),
        }
    }

    fn unexpected(&self, c: char, expected: &str) -> JsonStreamError {
        self.malformed(&format!("expected {}, found {:?}", expected, c))
    }
}

fn is_json_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

/// Strict JSON number grammar: `-?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-]?[0-9]+)?`
fn is_json_number(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;

    if bytes.first() == Some(&b'-') {
        i += 1;
    }

    match bytes.get(i) {
        Some(b'0') => i += 1,
        Some(b'1'..=b'9') => {
            while matches!(bytes.get(i), Some(b'0'..=b'9')) {
                i += 1;
            }
        }
        _ => return false,
    }

    if bytes.get(i) == Some(&b'.') {
        i += 1;
        let start = i;
        while matches!(bytes.get(i), Some(b'0'..=b'9')) {
            i += 1;
        }
        if i == start {
            return false;
        }
    }

    if matches!(bytes.get(i), Some(b'e' | b'E')) {
        i += 1;
        if matches!(bytes.get(i), Some(b'+' | b'-')) {
            i += 1;
        }
        let start = i;
        while matches!(bytes.get(i), Some(b'0'..=b'9')) {
            i += 1;
        }
        if i == start {
            return false;
        }
    }

    i == bytes.len()
}

/// Whether more characters could still turn `s` into a valid JSON number
fn is_json_number_prefix(s: &str) -> bool {
    #[derive(Clone, Copy)]
    enum At {
        Start,
        Sign,
        Zero,
        Int,
        Dot,
        Frac,
        Exp,
        ExpSign,
        ExpDigits,
    }

    let mut at = At::Start;
    for b in s.bytes() {
        at = match (at, b) {
            (At::Start, b'-') => At::Sign,
            (At::Start | At::Sign, b'0') => At::Zero,
            (At::Start | At::Sign, b'1'..=b'9') => At::Int,
            (At::Int, b'0'..=b'9') => At::Int,
            (At::Zero | At::Int, b'.') => At::Dot,
            (At::Dot | At::Frac, b'0'..=b'9') => At::Frac,
            (At::Zero | At::Int | At::Frac, b'e' | b'E') => At::Exp,
            (At::Exp, b'+' | b'-') => At::ExpSign,
            (At::Exp | At::ExpSign | At::ExpDigits, b'0'..=b'9') => At::ExpDigits,
            _ => return false,
        };
    }
    true
}

/// Parse a sequence of fragments and collect every emitted value
///
/// Useful for testing or when all fragments are already available.
pub fn parse_fragments<'a>(
    fragments: impl IntoIterator<Item = &'a str>,
    options: ParserOptions,
) -> (Vec<StreamedValue>, Result<(), JsonStreamError>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);

    let mut parser = StreamingJsonParser::with_options(
        options,
        Box::new(move |value| sink.lock().push(value)),
    );
    for fragment in fragments {
        parser.write(fragment);
    }
    let result = parser.end();

    let values = std::mem::take(&mut *collected.lock());
    (values, result)
}
