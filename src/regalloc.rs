//! Linear-scan register allocator.
//!
//! Runs to convergence: each pass recomputes live ranges from scratch,
//! applies the commutative-operand swap, tries to place every statement's
//! value in a register under the ABI's constraints, and — if the physical
//! register file is exhausted — rewrites the program with one spill and one
//! reload per remaining use, then starts over. The loop terminates because
//! every rewrite strictly shrinks the live range of the spilled value.

use std::collections::HashMap;

use crate::abi::Abi;
use crate::error::Error;
use crate::ssa::{LiveRange, MemLoc, Ssa, SsaKind, SsaStmt, StmtId};

/// Outcome of a completed allocation: how much stack space the compiled
/// expression needs for spill slots, in bytes, already rounded to 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Total spill-slot stack space, a multiple of 16.
    pub stack_bytes: u32,
}

/// A safety bound on allocation passes: each pass spills exactly one
/// statement, so this is far more than any real expression could need.
fn max_passes(len: usize) -> usize {
    len * 4 + 64
}

/// Allocate registers and stack slots for `ssa` in place.
pub fn allocate(ssa: &mut Ssa, abi: &dyn Abi) -> Result<Allocation, Error> {
    let mut working = ssa.clone();
    let mut next_stack_offset: u32 = 0;

    let locs = 'converge: {
        for _ in 0..max_passes(working.len().max(1)) {
            working.compute_live_ranges();
            apply_commutative_swap(&mut working);
            let forced = compute_forced_assignments(&working, abi);
            match try_linear_scan(&working, abi, &forced) {
                Ok(locs) => break 'converge locs,
                Err(victim) => {
                    working = rewrite_with_spill(&working, victim, &mut next_stack_offset);
                }
            }
        }
        return Err(Error::InternalError {
            where_: "regalloc::allocate (did not converge)",
        });
    };

    for (id, loc) in locs {
        working.statements_mut()[id as usize].loc = Some(loc);
    }

    let stack_bytes = round_up_16(next_stack_offset);
    if stack_bytes > 0 {
        working = prepend_stack_allocate(&working, stack_bytes);
    }

    *ssa = working;
    Ok(Allocation { stack_bytes })
}

fn round_up_16(bytes: u32) -> u32 {
    (bytes + 15) & !15
}

/// Swap the operands of commutative binary statements so that, when
/// possible, the operand whose live range ends at this statement (i.e. has
/// no use beyond it) is on the left. The x86-64 SSE2 encoding used by the
/// emitter overwrites its left (destination) operand, so this ordering
/// avoids a copy whenever the right operand would otherwise need to
/// survive past the operation.
fn apply_commutative_swap(ssa: &mut Ssa) {
    let ranges: Vec<LiveRange> = ssa.statements().iter().map(|s| s.live_range).collect();
    for (i, stmt) in ssa.statements_mut().iter_mut().enumerate() {
        if let SsaKind::BinaryOp { op, left, right } = &mut stmt.kind {
            if !op.is_commutative() {
                continue;
            }
            let i = i as u32;
            let left_dies_here = ranges[*left as usize].end == i + 1;
            let right_dies_here = ranges[*right as usize].end == i + 1;
            if right_dies_here && !left_dies_here {
                std::mem::swap(left, right);
            }
        }
    }
}

/// Registers the calling convention pins a statement's value to: the
/// overall result, a call's arguments, and a call's own result.
fn compute_forced_assignments(ssa: &Ssa, abi: &dyn Abi) -> HashMap<StmtId, u32> {
    let mut forced = HashMap::new();
    if !ssa.is_empty() {
        forced.insert(ssa.result(), abi.return_fp_register());
    }
    for (i, stmt) in ssa.statements().iter().enumerate() {
        if let SsaKind::FunctionCall { args, .. } = &stmt.kind {
            forced.insert(i as StmtId, abi.return_fp_register());
            let slots = abi.call_arg_fp_registers();
            for (argn, arg) in args.iter().enumerate() {
                if let Some(&reg) = slots.get(argn) {
                    forced.insert(*arg, reg);
                }
            }
        }
    }
    forced
}

struct ActiveInterval {
    stmt: StmtId,
    register: u32,
    end: u32,
    activated_at: u32,
}

/// Try to assign every non-`Spill` statement a physical register. Returns
/// the chosen locations on success, or the statement to spill on failure.
fn try_linear_scan(
    ssa: &Ssa,
    abi: &dyn Abi,
    forced: &HashMap<StmtId, u32>,
) -> Result<HashMap<StmtId, MemLoc>, StmtId> {
    let num_regs = abi.scratch_fp_register_count();
    let mut active: Vec<ActiveInterval> = Vec::new();
    let mut assigned = HashMap::new();

    for (i, stmt) in ssa.statements().iter().enumerate() {
        let i = i as u32;

        // An operand whose live range ends *at* this statement (its last
        // use is this statement's own input) is expired here, before this
        // statement's own register is chosen: the two-address x86-64
        // encoding reads such an operand and then overwrites its register,
        // so the statement's result is free to reuse it.
        active.retain(|a| a.end > i + 1);

        if matches!(stmt.kind, SsaKind::Spill { .. }) {
            continue;
        }

        // Every xmm register not holding one of this call's own arguments
        // is clobbered by the callee; anything still active here (an
        // argument's own range already ended above if this was its last
        // use) must be spilled before the call instead of assigned a
        // register.
        if let SsaKind::FunctionCall { args, .. } = &stmt.kind {
            if let Some(clobbered) = active.iter().find(|a| !args.contains(&a.stmt)) {
                return Err(clobbered.stmt);
            }
        }

        let occupied: Vec<u32> = active.iter().map(|a| a.register).collect();

        let register = if let Some(&want) = forced.get(&i) {
            match active.iter().position(|a| a.register == want) {
                Some(pos) => return Err(active[pos].stmt),
                None => want,
            }
        } else {
            match (0..num_regs).find(|r| !occupied.contains(r)) {
                Some(free) => free,
                None => {
                    let victim = active
                        .iter()
                        .max_by_key(|a| (a.end, a.activated_at))
                        .expect("register file exhausted with no active intervals");
                    return Err(victim.stmt);
                }
            }
        };

        active.push(ActiveInterval {
            stmt: i,
            register,
            end: stmt.live_range.end,
            activated_at: i,
        });
        assigned.insert(i, MemLoc::Register(register));
    }

    Ok(assigned)
}

/// Rewrite `ssa`, spilling `victim` to a fresh stack slot and reloading it
/// at every remaining use. `next_offset` is advanced by the slot's size.
fn rewrite_with_spill(ssa: &Ssa, victim: StmtId, next_offset: &mut u32) -> Ssa {
    let uses: Vec<StmtId> = (0..ssa.len() as StmtId)
        .filter(|&j| ssa.operands_of(j).contains(&victim))
        .collect();

    let spill_offset = *next_offset;
    *next_offset += 8;

    let mut new_stmts: Vec<SsaStmt> = Vec::new();
    let mut old_to_new: HashMap<StmtId, StmtId> = HashMap::new();
    let mut reload_for: HashMap<StmtId, StmtId> = HashMap::new();
    let mut spill_id: Option<StmtId> = None;

    let point = |id: u32| LiveRange { start: id, end: id + 1 };

    for old_id in 0..ssa.len() as StmtId {
        if uses.contains(&old_id) {
            let reload_new_id = new_stmts.len() as StmtId;
            new_stmts.push(SsaStmt {
                kind: SsaKind::Reload {
                    value: spill_id.expect("victim spilled before any of its uses"),
                },
                live_range: point(reload_new_id),
                loc: None,
            });
            reload_for.insert(old_id, reload_new_id);
        }

        let remapped = remap_kind(&ssa.statements()[old_id as usize].kind, old_id, victim, &reload_for, &old_to_new);
        let new_id = new_stmts.len() as StmtId;
        new_stmts.push(SsaStmt {
            kind: remapped,
            live_range: point(new_id),
            loc: None,
        });
        old_to_new.insert(old_id, new_id);

        if old_id == victim {
            let this_spill_id = new_stmts.len() as StmtId;
            new_stmts.push(SsaStmt {
                kind: SsaKind::Spill { value: new_id },
                live_range: point(this_spill_id),
                loc: Some(MemLoc::Stack(spill_offset as u64)),
            });
            spill_id = Some(this_spill_id);
        }
    }

    Ssa::from_statements(new_stmts)
}

fn remap_operand(
    id: StmtId,
    old_id: StmtId,
    victim: StmtId,
    reload_for: &HashMap<StmtId, StmtId>,
    old_to_new: &HashMap<StmtId, StmtId>,
) -> StmtId {
    if id == victim {
        reload_for[&old_id]
    } else {
        old_to_new[&id]
    }
}

fn remap_kind(
    kind: &SsaKind,
    old_id: StmtId,
    victim: StmtId,
    reload_for: &HashMap<StmtId, StmtId>,
    old_to_new: &HashMap<StmtId, StmtId>,
) -> SsaKind {
    let op = |id: StmtId| remap_operand(id, old_id, victim, reload_for, old_to_new);
    match kind {
        SsaKind::VariableLoad { name } => SsaKind::VariableLoad { name: name.clone() },
        SsaKind::LiteralLoad { canonical_name, value } => SsaKind::LiteralLoad {
            canonical_name: canonical_name.clone(),
            value: *value,
        },
        SsaKind::UnaryOp { op: unop, operand } => SsaKind::UnaryOp {
            op: *unop,
            operand: op(*operand),
        },
        SsaKind::BinaryOp { op: binop, left, right } => SsaKind::BinaryOp {
            op: *binop,
            left: op(*left),
            right: op(*right),
        },
        SsaKind::FunctionCall { name, args } => SsaKind::FunctionCall {
            name: name.clone(),
            args: args.iter().map(|a| op(*a)).collect(),
        },
        SsaKind::Spill { value } => SsaKind::Spill { value: op(*value) },
        SsaKind::Reload { value } => SsaKind::Reload { value: op(*value) },
        SsaKind::StackAllocate { size } => SsaKind::StackAllocate { size: *size },
    }
}

fn prepend_stack_allocate(ssa: &Ssa, stack_bytes: u32) -> Ssa {
    let shift = |id: StmtId| id + 1;
    let mut new_stmts = Vec::with_capacity(ssa.len() + 1);
    new_stmts.push(SsaStmt {
        kind: SsaKind::StackAllocate { size: stack_bytes },
        live_range: LiveRange { start: 0, end: 1 },
        loc: None,
    });
    for stmt in ssa.statements() {
        let kind = match &stmt.kind {
            SsaKind::VariableLoad { name } => SsaKind::VariableLoad { name: name.clone() },
            SsaKind::LiteralLoad { canonical_name, value } => SsaKind::LiteralLoad {
                canonical_name: canonical_name.clone(),
                value: *value,
            },
            SsaKind::UnaryOp { op, operand } => SsaKind::UnaryOp {
                op: *op,
                operand: shift(*operand),
            },
            SsaKind::BinaryOp { op, left, right } => SsaKind::BinaryOp {
                op: *op,
                left: shift(*left),
                right: shift(*right),
            },
            SsaKind::FunctionCall { name, args } => SsaKind::FunctionCall {
                name: name.clone(),
                args: args.iter().map(|a| shift(*a)).collect(),
            },
            SsaKind::Spill { value } => SsaKind::Spill { value: shift(*value) },
            SsaKind::Reload { value } => SsaKind::Reload { value: shift(*value) },
            SsaKind::StackAllocate { size } => SsaKind::StackAllocate { size: *size },
        };
        new_stmts.push(SsaStmt {
            kind,
            live_range: LiveRange {
                start: stmt.live_range.start + 1,
                end: stmt.live_range.end + 1,
            },
            loc: stmt.loc,
        });
    }
    Ssa::from_statements(new_stmts)
}
