//! Binary operators, their precedence and tokenization.

/// Operators that appear between two operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Shl,
    /// `>>`, logical
    Shr,
    /// `>>>`, arithmetic
    Sar,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    BitAnd,
    BitXor,
    BitOr,
    LogicalAnd,
    LogicalOr,
}

/// Anything the parser can find in operator position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Binary(BinaryOp),
    /// `a ? b : c`
    Ternary,
    /// `a ?: b`
    NullCoalescing,
    /// `=` when `None`, compound assignment otherwise
    Assign(Option<BinaryOp>),
    /// `++` / `--` after an operand
    Postfix,
    Comma,
}

pub const PREC_UNARY: u8 = 14;
pub const PREC_TERNARY: u8 = 3;
pub const PREC_ASSIGN: u8 = 2;
pub const PREC_COMMA: u8 = 1;

impl BinaryOp {
    pub fn precedence(self) -> u8 {
        match self {
            Self::Mul | Self::Div | Self::Mod => 13,
            Self::Add | Self::Sub => 12,
            Self::Shl | Self::Shr | Self::Sar => 11,
            Self::Less | Self::LessEqual | Self::Greater | Self::GreaterEqual => 10,
            Self::Equal | Self::NotEqual => 9,
            Self::BitAnd => 8,
            Self::BitXor => 7,
            Self::BitOr => 6,
            Self::LogicalAnd => 5,
            Self::LogicalOr => 4,
        }
    }

    /// Apply the operator. Returns `None` on division by zero.
    pub fn apply(self, lhs: u32, rhs: u32) -> Option<u32> {
        Some(match self {
            Self::Mul => lhs.wrapping_mul(rhs),
            Self::Div => lhs.checked_div(rhs)?,
            Self::Mod => lhs.checked_rem(rhs)?,
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::Shl => lhs.wrapping_shl(rhs),
            Self::Shr => lhs.wrapping_shr(rhs),
            Self::Sar => (lhs as i32).wrapping_shr(rhs) as u32,
            Self::Less => (lhs < rhs) as u32,
            Self::LessEqual => (lhs <= rhs) as u32,
            Self::Greater => (lhs > rhs) as u32,
            Self::GreaterEqual => (lhs >= rhs) as u32,
            Self::Equal => (lhs == rhs) as u32,
            Self::NotEqual => (lhs != rhs) as u32,
            Self::BitAnd => lhs & rhs,
            Self::BitXor => lhs ^ rhs,
            Self::BitOr => lhs | rhs,
            Self::LogicalAnd => (lhs != 0 && rhs != 0) as u32,
            Self::LogicalOr => (lhs != 0 || rhs != 0) as u32,
        })
    }
}

impl Operator {
    pub fn precedence(self) -> u8 {
        match self {
            Self::Binary(op) => op.precedence(),
            Self::Ternary | Self::NullCoalescing => PREC_TERNARY,
            Self::Assign(_) => PREC_ASSIGN,
            Self::Comma => PREC_COMMA,
            Self::Postfix => PREC_UNARY,
        }
    }
}

// Longest tokens first so that `>>>=` is never read as `>>` followed by `>=`.
const TOKENS: &[(&str, Operator)] = &[
    (">>>=", Operator::Assign(Some(BinaryOp::Sar))),
    ("<<<=", Operator::Assign(Some(BinaryOp::Shl))),
    (">>>", Operator::Binary(BinaryOp::Sar)),
    ("<<<", Operator::Binary(BinaryOp::Shl)),
    (">>=", Operator::Assign(Some(BinaryOp::Shr))),
    ("<<=", Operator::Assign(Some(BinaryOp::Shl))),
    (">>", Operator::Binary(BinaryOp::Shr)),
    ("<<", Operator::Binary(BinaryOp::Shl)),
    ("<=", Operator::Binary(BinaryOp::LessEqual)),
    (">=", Operator::Binary(BinaryOp::GreaterEqual)),
    ("==", Operator::Binary(BinaryOp::Equal)),
    ("!=", Operator::Binary(BinaryOp::NotEqual)),
    ("&&", Operator::Binary(BinaryOp::LogicalAnd)),
    ("||", Operator::Binary(BinaryOp::LogicalOr)),
    ("?:", Operator::NullCoalescing),
    ("++", Operator::Postfix),
    ("--", Operator::Postfix),
    ("+=", Operator::Assign(Some(BinaryOp::Add))),
    ("-=", Operator::Assign(Some(BinaryOp::Sub))),
    ("*=", Operator::Assign(Some(BinaryOp::Mul))),
    ("/=", Operator::Assign(Some(BinaryOp::Div))),
    ("%=", Operator::Assign(Some(BinaryOp::Mod))),
    ("&=", Operator::Assign(Some(BinaryOp::BitAnd))),
    ("|=", Operator::Assign(Some(BinaryOp::BitOr))),
    ("^=", Operator::Assign(Some(BinaryOp::BitXor))),
    ("*", Operator::Binary(BinaryOp::Mul)),
    ("/", Operator::Binary(BinaryOp::Div)),
    ("%", Operator::Binary(BinaryOp::Mod)),
    ("+", Operator::Binary(BinaryOp::Add)),
    ("-", Operator::Binary(BinaryOp::Sub)),
    ("<", Operator::Binary(BinaryOp::Less)),
    (">", Operator::Binary(BinaryOp::Greater)),
    ("&", Operator::Binary(BinaryOp::BitAnd)),
    ("^", Operator::Binary(BinaryOp::BitXor)),
    ("|", Operator::Binary(BinaryOp::BitOr)),
    ("?", Operator::Ternary),
    ("=", Operator::Assign(None)),
    (",", Operator::Comma),
];

/// Match the operator at the start of `input`, returning it and its length
pub fn match_operator(input: &[u8]) -> Option<(Operator, usize)> {
    TOKENS
        .iter()
        .find(|(token, _)| input.starts_with(token.as_bytes()))
        .map(|&(token, op)| (op, token.len()))
}
