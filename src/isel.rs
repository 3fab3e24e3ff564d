//! Instruction selection.
//!
//! Lowers an allocated [`Ssa`] into a flat sequence of abstract [`Instr`]s.
//! Registers and stack slots are still the allocator's logical ids; the
//! x86-64 backend is the only module that knows their physical encoding.

use crate::abi::Abi;
use crate::ast::{BinOp, UnOp};
use crate::error::Error;
use crate::ssa::{MemLoc, Ssa, SsaKind};
use crate::symtab::SymbolTable;

/// One target-independent operation, referencing operands by the
/// allocator's logical register index or stack byte offset.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Load a double from the variables array at `offset` into `dst`.
    LoadVariable { dst: u32, offset: u64 },
    /// Load a double from the literals array at `offset` into `dst`.
    LoadLiteral { dst: u32, offset: u64 },
    /// Copy one register to another. Inserted whenever a two-address
    /// operation's destination doesn't already hold its left operand.
    Move { dst: u32, src: u32 },
    /// Negate `dst` in place (lowered to xorpd against a sign-bit mask;
    /// SSE2 has no negate instruction).
    Neg { dst: u32 },
    /// `dst = dst <op> rhs`, a two-address SSE2 operation.
    BinOp { op: BinOp, dst: u32, rhs: u32 },
    /// Call a registered library function; arguments are already in the
    /// ABI's call-argument registers by construction of the allocator's
    /// constrained pre-assignment, and the result lands in `dst`.
    Call { name: String, arg_count: usize, dst: u32 },
    /// Store `src` to the spill slot at `stack_offset`.
    SpillStore { src: u32, stack_offset: u64 },
    /// Load the spill slot at `stack_offset` into `dst`.
    ReloadLoad { dst: u32, stack_offset: u64 },
    /// Reserve `size` bytes of stack space for spill slots.
    StackAllocate { size: u32 },
    /// Return the value in `src` to the caller.
    Return { src: u32 },
}

fn register_of(ssa: &Ssa, id: u32) -> u32 {
    match ssa.statements()[id as usize].loc {
        Some(MemLoc::Register(r)) => r,
        other => unreachable!("operand {id} has no register location: {other:?}"),
    }
}

fn stack_offset_of(ssa: &Ssa, id: u32) -> u64 {
    match ssa.statements()[id as usize].loc {
        Some(MemLoc::Stack(offset)) => offset,
        other => unreachable!("operand {id} has no stack location: {other:?}"),
    }
}

/// Lower every statement of `ssa` to its [`Instr`] sequence.
pub fn select(ssa: &Ssa, symtable: &SymbolTable, abi: &dyn Abi) -> Result<Vec<Instr>, Error> {
    let mut out = Vec::with_capacity(ssa.len() + 1);

    for (i, stmt) in ssa.statements().iter().enumerate() {
        let i = i as u32;
        match &stmt.kind {
            SsaKind::VariableLoad { name } => {
                let symbol = symtable.variable(name).ok_or(Error::InternalError {
                    where_: "isel::select (missing variable symbol)",
                })?;
                out.push(Instr::LoadVariable {
                    dst: register_of(ssa, i),
                    offset: symbol.offset() as u64,
                });
            }
            SsaKind::LiteralLoad { canonical_name, .. } => {
                let symbol = symtable
                    .literal(canonical_name)
                    .ok_or(Error::InternalError {
                        where_: "isel::select (missing literal symbol)",
                    })?;
                out.push(Instr::LoadLiteral {
                    dst: register_of(ssa, i),
                    offset: symbol.offset() as u64,
                });
            }
            SsaKind::UnaryOp { op, operand } => {
                let dst = register_of(ssa, i);
                let src = register_of(ssa, *operand);
                if dst != src {
                    out.push(Instr::Move { dst, src });
                }
                match op {
                    UnOp::Neg => out.push(Instr::Neg { dst }),
                }
            }
            SsaKind::BinaryOp { op, left, right } => {
                let dst = register_of(ssa, i);
                let lhs = register_of(ssa, *left);
                let rhs = register_of(ssa, *right);
                if dst != lhs {
                    out.push(Instr::Move { dst, src: lhs });
                }
                out.push(Instr::BinOp { op: *op, dst, rhs });
            }
            SsaKind::FunctionCall { name, args } => {
                out.push(Instr::Call {
                    name: name.clone(),
                    arg_count: args.len(),
                    dst: register_of(ssa, i),
                });
            }
            SsaKind::Spill { value } => {
                out.push(Instr::SpillStore {
                    src: register_of(ssa, *value),
                    stack_offset: stack_offset_of(ssa, i),
                });
            }
            SsaKind::Reload { value } => {
                out.push(Instr::ReloadLoad {
                    dst: register_of(ssa, i),
                    stack_offset: stack_offset_of(ssa, *value),
                });
            }
            SsaKind::StackAllocate { size } => {
                out.push(Instr::StackAllocate { size: *size });
            }
        }
    }

    if !ssa.is_empty() {
        let result_reg = register_of(ssa, ssa.result());
        debug_assert_eq!(
            result_reg,
            abi.return_fp_register(),
            "allocator failed to pin the final result to the return register"
        );
        out.push(Instr::Return { src: result_reg });
    }

    Ok(out)
}
