use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{trace, warn};

use crate::cpu::Register;
use crate::registry::{CAVE_PREFIX, CODECAVE_ALIAS};

use super::literal::{Cast, parse_cast, parse_literal};
use super::operator::{BinaryOp, Operator, PREC_ASSIGN, PREC_COMMA, PREC_TERNARY, match_operator};
use super::{Evaluation, ExpressionError, Scope};

static WARNED_POSTFIX: AtomicBool = AtomicBool::new(false);
static WARNED_ASSIGNMENT: AtomicBool = AtomicBool::new(false);

fn warn_once(flag: &AtomicBool, message: &str) {
    if !flag.swap(true, Ordering::Relaxed) {
        warn!("{}", message);
    }
}

type ParseResult<T> = Result<T, ExpressionError>;

/// Deepest chain of unary operators and brackets accepted
const MAX_NESTING: usize = 128;

/// Precedence-climbing evaluator over a byte cursor.
///
/// Bracketed sub-expressions are evaluated in place by narrowing `limit` to
/// the matching closing bracket, so offsets in errors always refer to the
/// original input.
pub(super) struct Parser<'t, 's> {
    input: &'t [u8],
    pos: usize,
    limit: usize,
    scope: &'s Scope<'s>,
    /// Inside the untaken side of `&&`, `||` or `?:`; failures yield 0
    skipping: bool,
    depth: usize,
}

impl<'t, 's> Parser<'t, 's> {
    pub(super) fn new(text: &'t str, end: Option<u8>, scope: &'s Scope<'s>) -> Self {
        let input = text.as_bytes();
        let limit = end
            .and_then(|end| find_terminator(input, end))
            .unwrap_or(input.len());
        Self {
            input,
            pos: 0,
            limit,
            scope,
            skipping: false,
            depth: 0,
        }
    }

    pub(super) fn run(mut self) -> ParseResult<Evaluation> {
        let value = self.parse_expr(PREC_COMMA)?;
        self.expect_limit()?;
        trace!(
            "Evaluated '{}' = {:#x}",
            String::from_utf8_lossy(&self.input[..self.pos]),
            value
        );
        Ok(Evaluation {
            value,
            cursor: self.pos,
        })
    }

    fn peek(&self) -> Option<u8> {
        (self.pos < self.limit).then(|| self.input[self.pos])
    }

    fn rest(&self) -> &'t [u8] {
        &self.input[self.pos..self.limit]
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    /// Everything up to `limit` must have been consumed
    fn expect_limit(&mut self) -> ParseResult<()> {
        self.skip_whitespace();
        match self.peek() {
            None => Ok(()),
            Some(b'(' | b')') => Err(ExpressionError::UnmatchedGrouping(self.pos)),
            Some(b'[' | b']' | b'<' | b'>') => Err(ExpressionError::UnmatchedValueBrackets(self.pos)),
            Some(c) => Err(self.unknown_character(c)),
        }
    }

    fn unknown_character(&self, c: u8) -> ExpressionError {
        let character = std::str::from_utf8(&self.input[self.pos..])
            .ok()
            .and_then(|s| s.chars().next())
            .unwrap_or(c as char);
        ExpressionError::UnknownCharacter {
            character,
            offset: self.pos,
        }
    }

    fn parse_expr(&mut self, min_prec: u8) -> ParseResult<u32> {
        let mut lhs = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let op_pos = self.pos;
            let Some((op, len)) = match_operator(self.rest()) else {
                break;
            };
            if op.precedence() < min_prec {
                break;
            }
            self.pos += len;

            lhs = match op {
                Operator::Postfix => {
                    warn_once(&WARNED_POSTFIX, "Increment and decrement operators have no effect");
                    lhs
                }
                Operator::Binary(BinaryOp::LogicalAnd) => {
                    let rhs = self.parse_skippable(lhs == 0, op.precedence() + 1)?;
                    (lhs != 0 && rhs != 0) as u32
                }
                Operator::Binary(BinaryOp::LogicalOr) => {
                    let rhs = self.parse_skippable(lhs != 0, op.precedence() + 1)?;
                    (lhs != 0 || rhs != 0) as u32
                }
                Operator::Binary(binary) => {
                    let rhs = self.parse_expr(op.precedence() + 1)?;
                    self.apply(binary, lhs, rhs, op_pos)?
                }
                Operator::NullCoalescing => {
                    let rhs = self.parse_skippable(lhs != 0, PREC_TERNARY)?;
                    if lhs != 0 { lhs } else { rhs }
                }
                Operator::Ternary => {
                    let taken = self.parse_skippable(lhs == 0, PREC_COMMA)?;
                    self.skip_whitespace();
                    if self.peek() != Some(b':') {
                        return Err(match self.peek() {
                            Some(c) => self.unknown_character(c),
                            None => ExpressionError::UnexpectedEnd(self.pos),
                        });
                    }
                    self.pos += 1;
                    let not_taken = self.parse_skippable(lhs != 0, PREC_TERNARY)?;
                    if lhs != 0 { taken } else { not_taken }
                }
                Operator::Assign(compound) => {
                    warn_once(&WARNED_ASSIGNMENT, "Assignment operators have no effect");
                    let rhs = self.parse_expr(PREC_ASSIGN)?;
                    match compound {
                        Some(binary) => self.apply(binary, lhs, rhs, op_pos)?,
                        None => rhs,
                    }
                }
                Operator::Comma => self.parse_expr(PREC_ASSIGN)?,
            };
        }
        Ok(lhs)
    }

    fn parse_skippable(&mut self, skip: bool, min_prec: u8) -> ParseResult<u32> {
        let outer = self.skipping;
        self.skipping = outer || skip;
        let value = self.parse_expr(min_prec);
        self.skipping = outer;
        value
    }

    fn apply(&self, op: BinaryOp, lhs: u32, rhs: u32, at: usize) -> ParseResult<u32> {
        match op.apply(lhs, rhs) {
            Some(value) => Ok(value),
            None if self.skipping => Ok(0),
            None => Err(ExpressionError::DivisionByZero(at)),
        }
    }

    fn parse_unary(&mut self) -> ParseResult<u32> {
        if self.depth >= MAX_NESTING {
            return Err(ExpressionError::NestingTooDeep(self.pos));
        }
        self.depth += 1;
        let value = self.parse_operand();
        self.depth -= 1;
        value
    }

    fn parse_operand(&mut self) -> ParseResult<u32> {
        self.skip_whitespace();
        if let Some((cast, len)) = parse_cast(self.rest()) {
            self.pos += len;
            self.skip_whitespace();
            let raw = if self.peek() == Some(b'[') {
                self.parse_dereference(cast, true)?
            } else {
                self.parse_unary()?
            };
            return Ok(cast.convert(raw));
        }
        match self.peek() {
            Some(b'!') => {
                self.pos += 1;
                Ok((self.parse_unary()? == 0) as u32)
            }
            Some(b'~') => {
                self.pos += 1;
                Ok(!self.parse_unary()?)
            }
            Some(b'-') => {
                self.pos += 1;
                Ok(self.parse_unary()?.wrapping_neg())
            }
            Some(b'+') => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> ParseResult<u32> {
        let start = self.pos;
        match self.peek() {
            None => Err(ExpressionError::UnexpectedEnd(start)),
            Some(b'(') => {
                let close = self.matching(b'(', b')', ExpressionError::UnmatchedGrouping(start))?;
                self.parse_enclosed(close)
            }
            Some(b'[') if self.scope.regs.is_some() => self.parse_dereference(Cast::U32, false),
            Some(open @ (b'[' | b'<')) => self.parse_patch_value(open),
            Some(c) => {
                if let Some(regs) = self.scope.regs
                    && let Some(register) = Register::parse_prefix(
                        std::str::from_utf8(self.rest()).unwrap_or_default(),
                    )
                {
                    self.pos += 3;
                    return Ok(regs.get(register));
                }
                match parse_literal(self.rest(), self.scope.module_base) {
                    Some((value, len)) => {
                        self.pos += len;
                        Ok(value)
                    }
                    None => Err(self.unknown_character(c)),
                }
            }
        }
    }

    /// Find the bracket closing the one at `pos`, honouring nesting
    fn matching(&self, open: u8, close: u8, err: ExpressionError) -> ParseResult<usize> {
        let mut depth = 0usize;
        for i in self.pos..self.limit {
            let c = self.input[i];
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
        }
        Err(err)
    }

    /// Evaluate the sub-expression between the current opening bracket and `close`
    fn parse_enclosed(&mut self, close: usize) -> ParseResult<u32> {
        let outer = self.limit;
        self.pos += 1;
        self.limit = close;
        let value = self.parse_expr(PREC_COMMA).and_then(|value| {
            self.expect_limit()?;
            Ok(value)
        });
        self.limit = outer;
        self.pos = close + 1;
        value
    }

    fn parse_dereference(&mut self, cast: Cast, explicit: bool) -> ParseResult<u32> {
        let start = self.pos;
        if self.scope.regs.is_none() {
            if explicit {
                return Err(ExpressionError::DereferenceWithoutRegisters(start));
            }
            return self.parse_patch_value(b'[');
        }
        let close = self.matching(b'[', b']', ExpressionError::UnmatchedValueBrackets(start))?;
        let address = self.parse_enclosed(close)?;
        if self.skipping {
            return Ok(0);
        }
        let size = cast.read_size();
        let unreadable = ExpressionError::MemoryUnreadable { address, size };
        let memory = self.scope.memory.ok_or(unreadable.clone())?;
        let bytes = memory.read_bytes(address, size).map_err(|_| unreadable)?;
        let mut raw = [0u8; 4];
        raw[..size].copy_from_slice(&bytes);
        Ok(u32::from_le_bytes(raw))
    }

    fn parse_patch_value(&mut self, open: u8) -> ParseResult<u32> {
        let start = self.pos;
        let close_char = if open == b'[' { b']' } else { b'>' };
        let close = self.matching(open, close_char, ExpressionError::UnmatchedValueBrackets(start))?;
        let relative = open == b'[';
        let content = std::str::from_utf8(&self.input[start + 1..close])
            .unwrap_or_default()
            .trim();

        let value = if let Some(name) = content
            .strip_prefix(CAVE_PREFIX)
            .or_else(|| content.strip_prefix(CODECAVE_ALIAS))
        {
            self.pos = close + 1;
            self.lookup_cave(name)?
        } else if let Some(name) = content.strip_prefix("option:") {
            self.pos = close + 1;
            // Options are embedded as-is, never relative
            return self.lookup_option(name);
        } else if let Some(address) = self.scope.registry.resolve(content, self.scope.memory) {
            self.pos = close + 1;
            address
        } else {
            match self.parse_enclosed(close) {
                Err(ExpressionError::UnknownCharacter { .. }) if is_symbol(content) => {
                    if !self.skipping {
                        return Err(ExpressionError::SymbolNotFound(content.to_string()));
                    }
                    0
                }
                value => value?,
            }
        };

        Ok(if relative {
            value.wrapping_sub(self.scope.rel_source.wrapping_add(4))
        } else {
            value
        })
    }

    fn lookup_cave(&self, name: &str) -> ParseResult<u32> {
        match self.scope.registry.get(&format!("{CAVE_PREFIX}{name}")) {
            Some(address) => Ok(address),
            None if self.skipping => Ok(0),
            None => Err(ExpressionError::CaveNotFound(name.to_string())),
        }
    }

    fn lookup_option(&self, name: &str) -> ParseResult<u32> {
        match self.scope.options.get(name) {
            Some(value) => Ok(value.as_u32()),
            None if self.skipping => Ok(0),
            None => Err(ExpressionError::OptionNotFound(name.to_string())),
        }
    }
}

/// Looks like a registry name (`th_func`, `kernel32:ExitProcess`) rather than an expression
fn is_symbol(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '@'))
}

/// Position of the first `end` outside any brackets
fn find_terminator(input: &[u8], end: u8) -> Option<usize> {
    let mut depth = 0i32;
    for (i, &c) in input.iter().enumerate() {
        if c == end && depth <= 0 {
            return Some(i);
        }
        match c {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            _ => {}
        }
    }
    None
}
