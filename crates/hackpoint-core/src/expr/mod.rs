//! Expression evaluator shared by the binhack DSL and breakpoint handlers.
//!
//! Expressions are evaluated directly while parsing; there is no syntax tree.
//! All values are 32-bit unsigned integers with wrapping arithmetic.
//!
//! Without a register context, `[...]` is a patch value relative to
//! [`Scope::rel_source`] and `<...>` an absolute one. Their contents are one of
//! `cave:NAME`, `option:NAME`, a registered address name, or a nested expression.
//! With a register context, `[...]` reads memory instead.

mod literal;
mod operator;
mod parser;

use thiserror::Error;
use tracing::error;

use crate::cpu::CpuState;
use crate::memory::ReadMemory;
use crate::options::OptionStore;
use crate::registry::AddressRegistry;

pub use literal::{Cast, parse_literal};
pub use operator::BinaryOp;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("Unmatched grouping brackets at offset {0}")]
    UnmatchedGrouping(usize),

    #[error("Unmatched patch value brackets at offset {0}")]
    UnmatchedValueBrackets(usize),

    #[error("Unknown character '{character}' at offset {offset}")]
    UnknownCharacter { character: char, offset: usize },

    #[error("Unexpected end of expression at offset {0}")]
    UnexpectedEnd(usize),

    #[error("Option '{0}' not found")]
    OptionNotFound(String),

    #[error("Code cave '{0}' not found")]
    CaveNotFound(String),

    #[error("Symbol '{0}' not found")]
    SymbolNotFound(String),

    #[error("Dereference at offset {0} needs a register context")]
    DereferenceWithoutRegisters(usize),

    #[error("Cannot read {size} bytes at {address:#010x}")]
    MemoryUnreadable { address: u32, size: usize },

    #[error("Division by zero at offset {0}")]
    DivisionByZero(usize),

    #[error("Expression nested too deeply at offset {0}")]
    NestingTooDeep(usize),
}

impl ExpressionError {
    /// A name that did not resolve, as opposed to malformed input
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            Self::OptionNotFound(_) | Self::CaveNotFound(_) | Self::SymbolNotFound(_)
        )
    }
}

/// Everything an expression can refer to
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub registry: &'a AddressRegistry,
    pub options: &'a OptionStore,
    pub memory: Option<&'a dyn ReadMemory>,
    pub regs: Option<&'a CpuState>,
    /// Base for `Rx`/`R` literals
    pub module_base: u32,
    /// Address the value will be written to, for relative patch values
    pub rel_source: u32,
}

impl<'a> Scope<'a> {
    pub fn new(registry: &'a AddressRegistry, options: &'a OptionStore) -> Self {
        Self {
            registry,
            options,
            memory: None,
            regs: None,
            module_base: 0,
            rel_source: 0,
        }
    }

    /// Attach a memory reader; also takes the module base from it
    pub fn with_memory(mut self, memory: &'a dyn ReadMemory) -> Self {
        self.module_base = memory.module_base();
        self.memory = Some(memory);
        self
    }

    pub fn with_regs(mut self, regs: &'a CpuState) -> Self {
        self.regs = Some(regs);
        self
    }

    pub fn with_rel_source(mut self, rel_source: u32) -> Self {
        self.rel_source = rel_source;
        self
    }
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("has_memory", &self.memory.is_some())
            .field("regs", &self.regs)
            .field("module_base", &format_args!("{:#010x}", self.module_base))
            .field("rel_source", &format_args!("{:#010x}", self.rel_source))
            .finish()
    }
}

/// Result of a successful evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub value: u32,
    /// Byte offset where parsing stopped: the terminator, or the end of input
    pub cursor: usize,
}

/// Evaluate `text` up to `end` (or the end of input).
pub fn evaluate(
    text: &str,
    end: Option<u8>,
    scope: &Scope<'_>,
) -> Result<Evaluation, ExpressionError> {
    parser::Parser::new(text, end, scope).run()
}

/// Evaluate `text`, logging any error and yielding 0 instead
pub fn evaluate_or_zero(text: &str, scope: &Scope<'_>) -> u32 {
    match evaluate(text, None, scope) {
        Ok(evaluation) => evaluation.value,
        Err(e) => {
            error!("Expression '{}': {}", text, e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Protection, SimulatedMemory};
    use crate::options::PatchValue;

    fn eval(text: &str) -> Result<u32, ExpressionError> {
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        evaluate(text, None, &Scope::new(&registry, &options)).map(|e| e.value)
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("1 + 2 * 3"), Ok(7));
        assert_eq!(eval("(1 + 2) * 3"), Ok(9));
        assert_eq!(eval("1 << 2 + 1"), Ok(8));
        assert_eq!(eval("6 & 3 ^ 1"), Ok(3));
        assert_eq!(eval("1 | 2 == 2"), Ok(1));
        assert_eq!(eval("10 - 4 - 3"), Ok(3));
        assert_eq!(eval("100 / 10 / 5"), Ok(2));
    }

    #[test]
    fn test_unary() {
        assert_eq!(eval("-1"), Ok(u32::MAX));
        assert_eq!(eval("~0"), Ok(u32::MAX));
        assert_eq!(eval("!5"), Ok(0));
        assert_eq!(eval("!!5"), Ok(1));
        assert_eq!(eval("2 * -3"), Ok(6u32.wrapping_neg()));
        assert_eq!(eval("+4"), Ok(4));
    }

    #[test]
    fn test_shifts() {
        assert_eq!(eval("0x80000000 >> 4"), Ok(0x0800_0000));
        assert_eq!(eval("0x80000000 >>> 4"), Ok(0xF800_0000));
        assert_eq!(eval("1 <<< 3"), Ok(8));
    }

    #[test]
    fn test_ternary_and_null_coalescing() {
        assert_eq!(eval("1 ? 2 : 3"), Ok(2));
        assert_eq!(eval("0 ? 2 : 3"), Ok(3));
        assert_eq!(eval("0 ? 1 : 0 ? 2 : 3"), Ok(3));
        assert_eq!(eval("5 ?: 7"), Ok(5));
        assert_eq!(eval("0 ?: 7"), Ok(7));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval("0 && 1 / 0"), Ok(0));
        assert_eq!(eval("1 || 1 / 0"), Ok(1));
        assert_eq!(eval("1 ? 4 : 1 / 0"), Ok(4));
        assert_eq!(eval("1 && 1 / 0"), Err(ExpressionError::DivisionByZero(7)));
    }

    #[test]
    fn test_comma_and_inert_operators() {
        assert_eq!(eval("1, 2"), Ok(2));
        assert_eq!(eval("3 += 4"), Ok(7));
        assert_eq!(eval("3 = 4"), Ok(4));
        assert_eq!(eval("3++ + 1"), Ok(4));
    }

    #[test]
    fn test_errors() {
        assert_eq!(eval("(1 + 2"), Err(ExpressionError::UnmatchedGrouping(0)));
        assert_eq!(eval("1 + 2)"), Err(ExpressionError::UnmatchedGrouping(5)));
        assert_eq!(eval("<1 + 2"), Err(ExpressionError::UnmatchedValueBrackets(0)));
        assert_eq!(
            eval("1 $ 2"),
            Err(ExpressionError::UnknownCharacter {
                character: '$',
                offset: 2
            })
        );
        assert_eq!(eval("5 % 0"), Err(ExpressionError::DivisionByZero(2)));
        assert_eq!(eval("1 +"), Err(ExpressionError::UnexpectedEnd(3)));
        assert_eq!(
            eval("byte ptr [0x1000]"),
            Err(ExpressionError::DereferenceWithoutRegisters(9))
        );
    }

    #[test]
    fn test_stops_at_terminator() {
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        let scope = Scope::new(&registry, &options);
        let result = evaluate("1 + 2) trailing", Some(b')'), &scope).unwrap();
        assert_eq!(result, Evaluation { value: 3, cursor: 5 });
    }

    #[test]
    fn test_patch_values() {
        let mut registry = AddressRegistry::new();
        registry.register_cave("data", 0x1000_0000);
        registry.register("th_func", 0x0040_2000);
        let mut options = OptionStore::new();
        options.set("lives", PatchValue::U8(9));
        let scope = Scope::new(&registry, &options).with_rel_source(0x0040_1000);

        let eval = |text: &str| evaluate(text, None, &scope).map(|e| e.value);
        assert_eq!(eval("<cave:data> + 4"), Ok(0x1000_0004));
        assert_eq!(eval("<codecave:data>"), Ok(0x1000_0000));
        assert_eq!(eval("[cave:data]"), Ok(0x1000_0000 - 0x0040_1004));
        assert_eq!(eval("[th_func]"), Ok(0x1000 - 4));
        assert_eq!(eval("<option:lives> * 2"), Ok(18));
        assert_eq!(eval("[option:lives]"), Ok(9));
        assert_eq!(eval("<0x10 + 0x20>"), Ok(0x30));
        assert_eq!(
            eval("<cave:missing>"),
            Err(ExpressionError::CaveNotFound("missing".to_string()))
        );
        assert_eq!(
            eval("<option:missing>"),
            Err(ExpressionError::OptionNotFound("missing".to_string()))
        );
        assert_eq!(
            eval("<kernel32:Missing>"),
            Err(ExpressionError::SymbolNotFound("kernel32:Missing".to_string()))
        );
        assert_eq!(eval("0 && <kernel32:Missing>"), Ok(0));
        assert!(eval("<cave:missing>").unwrap_err().is_unresolved());
        assert!(!eval("<1 $ 2>").unwrap_err().is_unresolved());
    }

    #[test]
    fn test_nesting_is_capped() {
        assert_eq!(eval(&format!("{}1", "-".repeat(64))), Ok(1));
        let deep = format!("{}1", "-".repeat(10_000));
        assert!(matches!(eval(&deep), Err(ExpressionError::NestingTooDeep(_))));
        let parens = format!("{}1{}", "(".repeat(5_000), ")".repeat(5_000));
        assert!(matches!(eval(&parens), Err(ExpressionError::NestingTooDeep(_))));
    }

    #[test]
    fn test_registers_and_dereference() {
        let memory = SimulatedMemory::builder()
            .module_base(0x400000)
            .map(
                0x0050_0000,
                vec![0xFE, 0xFF, 0x34, 0x12, 0x00, 0x00, 0x20, 0x40],
                Protection::ReadWrite,
            )
            .build();
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        let regs = CpuState {
            eax: 0x0050_0000,
            ecx: 3,
            ..Default::default()
        };
        let scope = Scope::new(&registry, &options)
            .with_memory(&memory)
            .with_regs(&regs);
        let eval = |text: &str| evaluate(text, None, &scope).map(|e| e.value);

        assert_eq!(eval("EAX + ecx"), Ok(0x0050_0003));
        assert_eq!(eval("[eax]"), Ok(0x1234_FFFE));
        assert_eq!(eval("(i8)[eax]"), Ok(0xFFFF_FFFE));
        assert_eq!(eval("(u8)[eax]"), Ok(0xFE));
        assert_eq!(eval("word ptr [eax + 2]"), Ok(0x1234));
        assert_eq!(eval("(i16)[eax]"), Ok(0xFFFF_FFFE));
        assert_eq!(eval("(f32)[eax + 4]"), Ok(2));
        assert_eq!(eval("[[eax] & 0 | eax]"), Ok(0x1234_FFFE));
        assert_eq!(eval("Rx10"), Ok(0x0040_0010));
        assert_eq!(
            eval("[0x100]"),
            Err(ExpressionError::MemoryUnreadable {
                address: 0x100,
                size: 4
            })
        );
    }

    #[test]
    fn test_registers_need_context() {
        assert!(matches!(
            eval("eax + 1"),
            Err(ExpressionError::UnknownCharacter { character: 'e', .. })
        ));
    }

    #[test]
    fn test_evaluate_or_zero() {
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        let scope = Scope::new(&registry, &options);
        assert_eq!(evaluate_or_zero("1 / 0", &scope), 0);
        assert_eq!(evaluate_or_zero("0x10 * 2", &scope), 0x20);
    }
}
