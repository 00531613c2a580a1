//! Compilation of binhack code strings into chunks.
//!
//! ```text
//! B8 [cave:strings+10] E8 [kernel32:Sleep] (f32: 1 + 1) +1.5f <option:lives>
//! ```

use thiserror::Error;

use crate::options::{OptionStore, PatchValue, ValueWidth};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DslError {
    #[error("Nested pointer brackets at offset {0}")]
    NestedPointer(usize),

    #[error("Pointer name starting at offset {0} is not terminated")]
    UnterminatedPointer(usize),

    #[error("Empty pointer name at offset {0}")]
    EmptyPointer(usize),

    #[error("Sized expression starting at offset {0} is not terminated")]
    UnterminatedExpression(usize),

    #[error("Unknown value width '{width}' at offset {offset}")]
    UnknownWidth { width: String, offset: usize },

    #[error("Invalid numeric literal '{text}' at offset {offset}")]
    InvalidLiteral { text: String, offset: usize },

    #[error("Unexpected character '{character}' at offset {offset}")]
    MalformedCharacter { character: char, offset: usize },
}

/// One unit of compiled code
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Bytes(Vec<u8>),
    /// `[name+off]` (relative) or `<name+off>` (absolute)
    Pointer {
        target: String,
        offset: u32,
        relative: bool,
    },
    /// `[option:NAME]` / `<option:NAME>`
    OptionValue(String),
    /// `(u16: expr)`
    Sized { width: ValueWidth, expr: String },
    Literal(PatchValue),
}

/// Size of a pointer in the target process
pub const POINTER_SIZE: usize = 4;

/// Width reserved for an option that is not defined
pub const MISSING_OPTION_SIZE: usize = 4;

impl Chunk {
    pub fn size(&self, options: &OptionStore) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Pointer { .. } => POINTER_SIZE,
            Self::OptionValue(name) => options
                .get(name)
                .map_or(MISSING_OPTION_SIZE, PatchValue::size),
            Self::Sized { width, .. } => width.size(),
            Self::Literal(value) => value.size(),
        }
    }
}

/// A compiled code string. Sizing and rendering both walk these chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Code {
    chunks: Vec<Chunk>,
}

impl Code {
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of bytes rendering will produce; never resolves names
    pub fn size(&self, options: &OptionStore) -> usize {
        self.chunks.iter().map(|chunk| chunk.size(options)).sum()
    }

    fn push_byte(&mut self, byte: u8) {
        match self.chunks.last_mut() {
            Some(Chunk::Bytes(bytes)) => bytes.push(byte),
            _ => self.chunks.push(Chunk::Bytes(vec![byte])),
        }
    }
}

fn is_literal_start(rest: &[u8]) -> bool {
    matches!(rest.first(), Some(b'+' | b'-' | b'.'))
        || rest.len() >= 2 && rest[0] == b'0' && matches!(rest[1], b'x' | b'X')
}

fn is_token_end(c: u8) -> bool {
    c.is_ascii_whitespace() || matches!(c, b'[' | b'<' | b'(')
}

/// Compile a code string
pub fn compile(code: &str) -> Result<Code, DslError> {
    let input = code.as_bytes();
    let mut out = Code::default();
    let mut pos = 0;

    while pos < input.len() {
        let c = input[pos];
        let rest = &input[pos..];

        if c.is_ascii_whitespace() {
            pos += 1;
        } else if c == b'[' || c == b'<' {
            let (chunk, len) = parse_pointer(code, pos)?;
            out.chunks.push(chunk);
            pos += len;
        } else if c == b'(' {
            let (chunk, len) = parse_sized(code, pos)?;
            out.chunks.push(chunk);
            pos += len;
        } else if is_literal_start(rest) {
            let len = rest.iter().position(|&c| is_token_end(c)).unwrap_or(rest.len());
            out.chunks.push(Chunk::Literal(parse_number(&code[pos..pos + len], pos)?));
            pos += len;
        } else if rest.len() >= 2 && rest[0].is_ascii_hexdigit() && rest[1].is_ascii_hexdigit() {
            let byte = (hex_value(rest[0]) << 4) | hex_value(rest[1]);
            out.push_byte(byte);
            pos += 2;
        } else {
            let character = code[pos..].chars().next().unwrap_or(c as char);
            return Err(DslError::MalformedCharacter {
                character,
                offset: pos,
            });
        }
    }
    Ok(out)
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        _ => c - b'A' + 10,
    }
}

fn parse_pointer(code: &str, start: usize) -> Result<(Chunk, usize), DslError> {
    let input = code.as_bytes();
    let relative = input[start] == b'[';
    let close = if relative { b']' } else { b'>' };

    let mut end = start + 1;
    loop {
        match input.get(end) {
            None => return Err(DslError::UnterminatedPointer(start)),
            Some(b'[' | b'<') => return Err(DslError::NestedPointer(end)),
            Some(&c) if c == close => break,
            Some(_) => end += 1,
        }
    }

    let name = code[start + 1..end].trim();
    if name.is_empty() {
        return Err(DslError::EmptyPointer(start));
    }
    let len = end + 1 - start;

    if let Some(option) = name.strip_prefix("option:") {
        return Ok((Chunk::OptionValue(option.trim().to_string()), len));
    }

    let (target, offset) = match name.rsplit_once('+') {
        Some((target, offset)) => {
            let digits = offset.trim();
            let digits = digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
                .unwrap_or(digits);
            let offset = u32::from_str_radix(digits, 16).map_err(|_| DslError::InvalidLiteral {
                text: offset.trim().to_string(),
                offset: start,
            })?;
            (target.trim(), offset)
        }
        None => (name, 0),
    };

    Ok((
        Chunk::Pointer {
            target: target.to_string(),
            offset,
            relative,
        },
        len,
    ))
}

fn parse_sized(code: &str, start: usize) -> Result<(Chunk, usize), DslError> {
    let input = code.as_bytes();
    let mut depth = 0usize;
    let mut end = None;
    for (i, &c) in input.iter().enumerate().skip(start) {
        match c {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end.ok_or(DslError::UnterminatedExpression(start))?;
    let inner = &code[start + 1..end];

    let (width, expr) = inner
        .split_once(':')
        .ok_or(DslError::UnterminatedExpression(start))?;
    let width = width.trim();
    let width: ValueWidth = width.parse().map_err(|_| DslError::UnknownWidth {
        width: width.to_string(),
        offset: start + 1,
    })?;

    Ok((
        Chunk::Sized {
            width,
            expr: expr.trim().to_string(),
        },
        end + 1 - start,
    ))
}

/// `+1.5f` → f32, `-2` / `.5` → f64, `0x10` / `-0x10` → 32-bit integer
fn parse_number(text: &str, offset: usize) -> Result<PatchValue, DslError> {
    let invalid = || DslError::InvalidLiteral {
        text: text.to_string(),
        offset,
    };

    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    if let Some(hex) = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        let value = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
        return Ok(PatchValue::U32(if negative { value.wrapping_neg() } else { value }));
    }

    if let Some(body) = text.strip_suffix(['f', 'F']) {
        return body
            .parse::<f32>()
            .map(PatchValue::F32)
            .map_err(|_| invalid());
    }

    text.parse::<f64>().map(PatchValue::F64).map_err(|_| invalid())
}
