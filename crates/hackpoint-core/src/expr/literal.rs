//! Numeric literals and width prefixes.

/// Width used when reading memory, and the conversion applied to the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cast {
    I8,
    U8,
    I16,
    U16,
    I32,
    #[default]
    U32,
    F32,
}

impl Cast {
    pub fn read_size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
        }
    }

    /// Narrow or reinterpret a raw value
    pub fn convert(self, raw: u32) -> u32 {
        match self {
            Self::I8 => raw as i8 as i32 as u32,
            Self::U8 => raw as u8 as u32,
            Self::I16 => raw as i16 as i32 as u32,
            Self::U16 => raw as u16 as u32,
            Self::I32 | Self::U32 => raw,
            Self::F32 => f32::from_bits(raw) as i32 as u32,
        }
    }
}

const CASTS: &[(&str, Cast)] = &[
    ("(i8)", Cast::I8),
    ("(u8)", Cast::U8),
    ("(i16)", Cast::I16),
    ("(u16)", Cast::U16),
    ("(i32)", Cast::I32),
    ("(u32)", Cast::U32),
    ("(f32)", Cast::F32),
    ("byte ptr", Cast::U8),
    ("word ptr", Cast::U16),
    ("dword ptr", Cast::U32),
    ("float ptr", Cast::F32),
];

fn starts_with_ignore_case(input: &[u8], token: &str) -> bool {
    input.len() >= token.len() && input[..token.len()].eq_ignore_ascii_case(token.as_bytes())
}

/// Match a cast (`(i16)`) or pointer size prefix (`word ptr`) at the start of `input`
pub fn parse_cast(input: &[u8]) -> Option<(Cast, usize)> {
    CASTS
        .iter()
        .find(|(token, _)| starts_with_ignore_case(input, token))
        .map(|&(token, cast)| (cast, token.len()))
}

fn accumulate(digits: &[u8], radix: u32) -> u32 {
    digits.iter().fold(0u32, |acc, &c| {
        let digit = (c as char).to_digit(radix).unwrap_or(0);
        acc.wrapping_mul(radix).wrapping_add(digit)
    })
}

fn hex_run(input: &[u8]) -> usize {
    input.iter().take_while(|c| c.is_ascii_hexdigit()).count()
}

fn decimal_run(input: &[u8]) -> usize {
    input.iter().take_while(|c| c.is_ascii_digit()).count()
}

/// Parse a numeric literal at the start of `input`.
///
/// - `0x1F`: hexadecimal
/// - `Rx1F`: hexadecimal offset from `module_base`
/// - `R100`: decimal offset from `module_base`
/// - `1F`, `0ff`: digit-leading runs containing `a-f` are hexadecimal
/// - `100`: decimal
///
/// Returns the value and the number of bytes consumed.
pub fn parse_literal(input: &[u8], module_base: u32) -> Option<(u32, usize)> {
    if starts_with_ignore_case(input, "0x") {
        let len = hex_run(&input[2..]);
        return (len > 0).then(|| (accumulate(&input[2..2 + len], 16), 2 + len));
    }
    if starts_with_ignore_case(input, "rx") {
        let len = hex_run(&input[2..]);
        return (len > 0).then(|| {
            let offset = accumulate(&input[2..2 + len], 16);
            (module_base.wrapping_add(offset), 2 + len)
        });
    }
    if matches!(input.first(), Some(b'R' | b'r')) {
        let len = decimal_run(&input[1..]);
        return (len > 0).then(|| {
            let offset = accumulate(&input[1..1 + len], 10);
            (module_base.wrapping_add(offset), 1 + len)
        });
    }
    if !input.first()?.is_ascii_digit() {
        return None;
    }
    let len = hex_run(input);
    let run = &input[..len];
    let radix = if run.iter().all(u8::is_ascii_digit) { 10 } else { 16 };
    Some((accumulate(run, radix), len))
}
