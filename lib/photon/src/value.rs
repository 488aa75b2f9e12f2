use std::fmt;

/// Nesting depth past which the decoder rejects input.
const MAX_DEPTH: usize = 64;
/// Upper bound on a single atom (symbol or string) in bytes.
const MAX_ATOM_SIZE: usize = 64 * 1024;
/// Upper bound on one buffered top-level form. Hostile peers that never
/// balance their parentheses are cut off here.
const MAX_FORM_SIZE: usize = 1 << 20;

/// A message value. Everything that crosses a mailbox or the peer wire is the
/// textual rendering of one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Symbol(String),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    /// Dotted pair, e.g. the keypair file body `(private . public)`.
    Pair(Box<Value>, Box<Value>),
}

impl Value {
    #[inline]
    pub fn sym(name: &str) -> Value {
        Value::Symbol(name.to_string())
    }

    #[inline]
    pub fn str(text: &str) -> Value {
        Value::Str(text.to_string())
    }

    #[inline]
    pub fn int(value: i64) -> Value {
        Value::Int(value)
    }

    #[inline]
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(items)
    }

    #[inline]
    pub fn pair(left: Value, right: Value) -> Value {
        Value::Pair(Box::new(left), Box::new(right))
    }

    #[inline]
    pub fn nil() -> Value {
        Value::List(Vec::new())
    }

    /// Leading symbol of a list form, the dispatch key for messages.
    #[inline]
    pub fn head(&self) -> Option<&str> {
        match self {
            Value::List(items) => items.first().and_then(Value::as_symbol),
            _ => None,
        }
    }

    /// Elements following the leading symbol of a list form.
    #[inline]
    pub fn tail(&self) -> &[Value] {
        match self {
            Value::List(items) if !items.is_empty() => &items[1..],
            _ => &[],
        }
    }

    #[inline]
    pub fn items(&self) -> &[Value] {
        match self {
            Value::List(items) => items,
            _ => &[],
        }
    }

    #[inline]
    pub fn nth(&self, index: usize) -> Option<&Value> {
        self.items().get(index)
    }

    #[inline]
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Value::Symbol(name) => Some(name),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    #[inline]
    pub fn as_pair(&self) -> Option<(&Value, &Value)> {
        match self {
            Value::Pair(left, right) => Some((left, right)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Symbol(name) => f.write_str(name),
            Value::Int(value) => write!(f, "{}", value),
            Value::Float(value) => write!(f, "{:?}", value),
            Value::Str(text) => {
                f.write_str("\"")?;
                for chr in text.chars() {
                    match chr {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        chr => write!(f, "{}", chr)?,
                    }
                }
                f.write_str("\"")
            }
            Value::List(items) => {
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Value::Pair(left, right) => write!(f, "({} . {})", left, right),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum SyntaxError {
    /// A closing parenthesis with no matching open.
    Unbalanced,
    /// A dot outside the `(head . tail)` position.
    MisplacedDot,
    /// An atom that looks numeric but does not parse as a number.
    BadNumber,
    /// An unknown string escape sequence.
    BadEscape,
    /// Atom or string exceeding the atom size limit.
    AtomTooLarge,
    /// A single form exceeding the buffered form limit.
    FormTooLarge,
    /// Nesting beyond the depth limit.
    TooDeep,
    /// Bytes that are not valid UTF-8.
    Utf8,
    /// The input ended before a complete form (whole-string parsing only).
    Incomplete,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            SyntaxError::Unbalanced => "unbalanced parenthesis",
            SyntaxError::MisplacedDot => "misplaced dot",
            SyntaxError::BadNumber => "malformed number",
            SyntaxError::BadEscape => "unknown string escape",
            SyntaxError::AtomTooLarge => "atom too large",
            SyntaxError::FormTooLarge => "form too large",
            SyntaxError::TooDeep => "nesting too deep",
            SyntaxError::Utf8 => "invalid utf-8",
            SyntaxError::Incomplete => "incomplete form",
        };
        f.write_str(text)
    }
}

/// Incremental decoder over a byte stream. Bytes are pushed as they arrive;
/// `next` yields one balanced top-level form at a time and retains any
/// trailing partial input for later pushes. This is the framing layer for
/// both mailbox drains and the ciphered peer stream.
pub struct Reader {
    buf: Vec<u8>,
    pos: usize,
}

impl Default for Reader {
    fn default() -> Reader {
        Reader::new()
    }
}

impl Reader {
    #[inline]
    pub fn new() -> Reader {
        Reader {
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Appends raw bytes to the decode buffer.
    #[inline]
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet consumed.
    #[inline]
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Discards all buffered input.
    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    /// Attempts to decode the next balanced form. `Ok(None)` means more input
    /// is required; the buffered prefix is preserved.
    pub fn next(&mut self) -> Result<Option<Value>, SyntaxError> {
        let mut cursor = Cursor {
            bytes: &self.buf[self.pos..],
            pos: 0,
        };

        match cursor.form(0) {
            Ok(Some(value)) => {
                self.pos += cursor.pos;
                self.compact();
                Ok(Some(value))
            }
            Ok(None) => {
                if self.pending() > MAX_FORM_SIZE {
                    return Err(SyntaxError::FormTooLarge);
                }
                self.compact();
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Reclaims consumed prefix space once it dominates the buffer.
    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > 4096 && self.pos * 2 > self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// Parses a complete textual form; trailing whitespace is permitted, trailing
/// content is not.
pub fn parse_str(text: &str) -> Result<Value, SyntaxError> {
    let mut reader = Reader::new();
    reader.push(text.as_bytes());
    reader.push(b" ");

    let value = reader.next()?.ok_or(SyntaxError::Incomplete)?;

    match reader.next()? {
        None => Ok(value),
        Some(_) => Err(SyntaxError::Incomplete),
    }
}

/// Parses a whitespace-separated sequence of forms.
pub fn parse_all(text: &str) -> Result<Vec<Value>, SyntaxError> {
    let mut reader = Reader::new();
    reader.push(text.as_bytes());
    reader.push(b" ");

    let mut values = Vec::new();
    while let Some(value) = reader.next()? {
        values.push(value);
    }

    Ok(values)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[inline]
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Skips whitespace and `;` comments. Returns false when the buffer is
    /// exhausted (a trailing comment without a newline counts as exhausted,
    /// since it may still grow).
    fn skip_blank(&mut self) -> bool {
        loop {
            match self.peek() {
                Some(byte) if (byte as char).is_ascii_whitespace() => self.pos += 1,
                Some(b';') => match self.bytes[self.pos..].iter().position(|&b| b == b'\n') {
                    Some(offset) => self.pos += offset + 1,
                    None => return false,
                },
                Some(_) => return true,
                None => return false,
            }
        }
    }

    /// Decodes one form starting at the cursor. `Ok(None)` signals that the
    /// buffer ends before the form is balanced.
    fn form(&mut self, depth: usize) -> Result<Option<Value>, SyntaxError> {
        if depth > MAX_DEPTH {
            return Err(SyntaxError::TooDeep);
        }

        if !self.skip_blank() {
            return Ok(None);
        }

        match self.peek().expect("skip_blank guarantees a byte") {
            b'(' => self.list(depth),
            b')' => Err(SyntaxError::Unbalanced),
            b'"' => self.string(),
            _ => self.atom(),
        }
    }

    fn list(&mut self, depth: usize) -> Result<Option<Value>, SyntaxError> {
        self.pos += 1;

        let mut items: Vec<Value> = Vec::new();
        let mut tail: Option<Value> = None;

        loop {
            if !self.skip_blank() {
                return Ok(None);
            }

            match self.peek().expect("skip_blank guarantees a byte") {
                b')' => {
                    self.pos += 1;
                    let value = match tail {
                        Some(right) => {
                            if items.len() != 1 {
                                return Err(SyntaxError::MisplacedDot);
                            }
                            Value::pair(items.pop().expect("dotted head present"), right)
                        }
                        None => Value::List(items),
                    };
                    return Ok(Some(value));
                }
                b'.' if self.is_dot_token() => {
                    if items.is_empty() || tail.is_some() {
                        return Err(SyntaxError::MisplacedDot);
                    }
                    self.pos += 1;
                    match self.form(depth + 1)? {
                        Some(value) => tail = Some(value),
                        None => return Ok(None),
                    }
                }
                _ => {
                    if tail.is_some() {
                        return Err(SyntaxError::MisplacedDot);
                    }
                    match self.form(depth + 1)? {
                        Some(value) => items.push(value),
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// A `.` is the dotted-pair marker only when followed by a delimiter.
    /// `.` glued to other atom characters stays part of the atom.
    fn is_dot_token(&self) -> bool {
        match self.bytes.get(self.pos + 1) {
            Some(&byte) => is_delimiter(byte),
            // Can't tell yet; claim it is a token and let `form` report
            // incompleteness when the follower never arrives.
            None => true,
        }
    }

    fn string(&mut self) -> Result<Option<Value>, SyntaxError> {
        let mut text = String::new();
        let mut scan = self.pos + 1;

        loop {
            if text.len() > MAX_ATOM_SIZE {
                return Err(SyntaxError::AtomTooLarge);
            }

            let byte = match self.bytes.get(scan) {
                Some(&byte) => byte,
                None => return Ok(None),
            };

            match byte {
                b'"' => {
                    self.pos = scan + 1;
                    return Ok(Some(Value::Str(text)));
                }
                b'\\' => {
                    let escape = match self.bytes.get(scan + 1) {
                        Some(&byte) => byte,
                        None => return Ok(None),
                    };
                    match escape {
                        b'"' => text.push('"'),
                        b'\\' => text.push('\\'),
                        b'n' => text.push('\n'),
                        b'r' => text.push('\r'),
                        b't' => text.push('\t'),
                        _ => return Err(SyntaxError::BadEscape),
                    }
                    scan += 2;
                }
                _ => {
                    // Consume one UTF-8 sequence.
                    let len = utf8_len(byte).ok_or(SyntaxError::Utf8)?;
                    if scan + len > self.bytes.len() {
                        return Ok(None);
                    }
                    let chunk =
                        std::str::from_utf8(&self.bytes[scan..scan + len]).map_err(|_| SyntaxError::Utf8)?;
                    text.push_str(chunk);
                    scan += len;
                }
            }
        }
    }

    fn atom(&mut self) -> Result<Option<Value>, SyntaxError> {
        let start = self.pos;
        let mut scan = start;

        loop {
            match self.bytes.get(scan) {
                // The atom may continue past the buffer end; wait for more.
                None => return Ok(None),
                Some(&byte) if is_delimiter(byte) => break,
                Some(_) => scan += 1,
            }

            if scan - start > MAX_ATOM_SIZE {
                return Err(SyntaxError::AtomTooLarge);
            }
        }

        let token = std::str::from_utf8(&self.bytes[start..scan]).map_err(|_| SyntaxError::Utf8)?;
        self.pos = scan;

        Ok(Some(classify_atom(token)?))
    }
}

#[inline]
fn is_delimiter(byte: u8) -> bool {
    (byte as char).is_ascii_whitespace() || byte == b'(' || byte == b')' || byte == b'"' || byte == b';'
}

/// Length of the UTF-8 sequence introduced by the given byte.
#[inline]
fn utf8_len(byte: u8) -> Option<usize> {
    match byte {
        0x00..=0x7f => Some(1),
        0xc0..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf7 => Some(4),
        _ => None,
    }
}

fn classify_atom(token: &str) -> Result<Value, SyntaxError> {
    debug_assert!(!token.is_empty());

    let numeric = {
        let unsigned = token.strip_prefix('-').or_else(|| token.strip_prefix('+')).unwrap_or(token);
        unsigned.chars().next().map_or(false, |chr| chr.is_ascii_digit())
    };

    if !numeric {
        return Ok(Value::Symbol(token.to_string()));
    }

    if token.contains('.') || token.contains('e') || token.contains('E') {
        token
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| SyntaxError::BadNumber)
    } else {
        token
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| SyntaxError::BadNumber)
    }
}

/// Builds a `(head args...)` message form.
pub fn message(head: &str, args: Vec<Value>) -> Value {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::sym(head));
    items.extend(args);
    Value::List(items)
}
