//! Eval command implementation.

use std::path::Path;

use anyhow::{Result, anyhow};
use hackpoint_core::{CpuState, Register, Scope, evaluate};

use super::target::{apply_quietly, build_memory, load_config};
use crate::TargetArgs;

/// Evaluate `expression` against the target, after applying `config`
pub fn eval_expression(
    expression: &str,
    regs: &[(String, u32)],
    config: Option<&Path>,
    target: &TargetArgs,
) -> Result<u32> {
    let memory = build_memory(target)?;
    let config = load_config(config)?;
    let engine = apply_quietly(&memory, target, &config)?;

    let mut state = CpuState::default();
    for (name, value) in regs {
        let register: Register = name
            .parse()
            .map_err(|_| anyhow!("Unknown register '{}'", name))?;
        state.set(register, *value);
    }

    let mut scope = Scope::new(engine.registry(), &config.options).with_memory(memory.as_ref());
    if !regs.is_empty() {
        scope = scope.with_regs(&state);
    }
    Ok(evaluate(expression, None, &scope)?.value)
}

/// Run the eval command
pub fn run(
    expression: &str,
    regs: &[(String, u32)],
    config: Option<&Path>,
    target: &TargetArgs,
) -> Result<()> {
    let value = eval_expression(expression, regs, config, target)?;
    println!("{} = 0x{:08X} ({}, unsigned {})", expression, value, value as i32, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::target::test_target as target;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_eval_with_symbols_and_registers() {
        let regs = vec![("ecx".to_string(), 0x10)];
        let value = eval_expression("<th_func> + ecx * 2", &regs, None, &target()).unwrap();
        assert_eq!(value, 0x402020);
        assert_eq!(eval_expression("Rx10", &[], None, &target()).unwrap(), 0x400010);
    }

    #[test]
    fn test_eval_sees_config_options_and_caves() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "options": {{ "speed": {{ "type": "i32", "val": -3 }} }},
                  "codecaves": {{ "data": {{ "size": 8 }} }} }}"#
        )
        .unwrap();
        let value = eval_expression("<option:speed>", &[], Some(file.path()), &target()).unwrap();
        assert_eq!(value as i32, -3);
        let cave = eval_expression("<cave:data>", &[], Some(file.path()), &target()).unwrap();
        assert_ne!(cave, 0);
    }

    #[test]
    fn test_eval_rejects_unknown_register() {
        let regs = vec![("xyz".to_string(), 1)];
        assert!(eval_expression("1", &regs, None, &target()).is_err());
    }
}
