use tracing::warn;

use crate::error::{Error, Result};
use crate::expr::{Scope, evaluate};

use super::dsl::{Chunk, Code, MISSING_OPTION_SIZE, POINTER_SIZE};

impl Code {
    /// Render the code for placement at `target`.
    ///
    /// Names that cannot be resolved are rendered as zero and reported as a
    /// warning. Sized expressions are evaluated with `target` plus the bytes
    /// written so far as their relative source.
    pub fn render(&self, target: u32, scope: &Scope<'_>) -> Result<Vec<u8>> {
        let expected = self.size(scope.options);
        let mut out = Vec::with_capacity(expected);

        for chunk in self.chunks() {
            let here = target.wrapping_add(out.len() as u32);
            match chunk {
                Chunk::Bytes(bytes) => out.extend_from_slice(bytes),
                Chunk::Pointer {
                    target: name,
                    offset,
                    relative,
                } => match scope.registry.resolve(name, scope.memory) {
                    Some(address) => {
                        let mut value = address.wrapping_add(*offset);
                        if *relative {
                            value = value.wrapping_sub(here.wrapping_add(POINTER_SIZE as u32));
                        }
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                    None => {
                        warn!("Function '{}' not found, writing zero at {:#010x}", name, here);
                        out.extend_from_slice(&[0; POINTER_SIZE]);
                    }
                },
                Chunk::OptionValue(name) => match scope.options.get(name) {
                    Some(value) => out.extend_from_slice(&value.to_bytes()),
                    None => {
                        warn!("Option '{}' not found, writing zero at {:#010x}", name, here);
                        out.extend_from_slice(&[0; MISSING_OPTION_SIZE]);
                    }
                },
                Chunk::Sized { width, expr } => {
                    let scope = scope.with_rel_source(here);
                    let value = match evaluate(expr, None, &scope) {
                        Ok(evaluation) => evaluation.value,
                        Err(e) if e.is_unresolved() => {
                            warn!("{}, writing zero at {:#010x}", e, here);
                            0
                        }
                        Err(e) => return Err(e.into()),
                    };
                    out.extend_from_slice(&width.from_u32(value).to_bytes());
                }
                Chunk::Literal(value) => out.extend_from_slice(&value.to_bytes()),
            }
        }

        if out.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                written: out.len(),
            });
        }
        Ok(out)
    }
}
