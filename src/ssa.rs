//! Single-assignment intermediate representation.
//!
//! Statements live in a flat arena (`Vec<SsaStmt>`); a statement's index in
//! that vector doubles as its `version` and as its position for live-range
//! purposes, matching an "operand fields point to earlier SSA statements"
//! contract without needing reference-counted handles.

use crate::ast::{Ast, AstNode, BinOp, NodeId, UnOp};
use crate::error::Error;
use crate::symtab::{SymbolKind, SymbolTable};

/// Index of a statement within an [`Ssa`]'s arena. Doubles as the
/// statement's SSA "version".
pub type StmtId = u32;

/// Which runtime array a `Memory` location is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    /// The caller-supplied variables array.
    Variables,
    /// The caller-supplied literals array.
    Literals,
}

/// Where a statement's value lives once the register allocator has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemLoc {
    /// A scratch floating-point register, identified by its ABI-relative
    /// index (0-based, not a raw ISA encoding).
    Register(u32),
    /// A spill slot, as a byte offset from the stack-allocation base.
    Stack(u64),
    /// A location inside one of the two runtime input arrays.
    Memory(MemKind, u64),
}

/// Half-open interval `[start, end)` of statement positions during which a
/// defined value must be retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    /// Position of the defining statement.
    pub start: u32,
    /// Exclusive position of the last use.
    pub end: u32,
}

impl LiveRange {
    fn point(at: u32) -> Self {
        LiveRange {
            start: at,
            end: at + 1,
        }
    }

    /// Number of statement positions this value must be retained for.
    pub fn duration(&self) -> u32 {
        self.end - self.start
    }

    /// Whether two ranges overlap (share at least one statement position).
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether two ranges genuinely require distinct registers.
    ///
    /// Differs from [`overlaps`](Self::overlaps) at exactly one boundary
    /// case: a range that dies at the statement where another is born
    /// (`self.end == other.start + 1`, or the symmetric case) is allowed to
    /// share a register. The dying operand is read before the new value is
    /// written, so the two-address x86-64 encoding can reuse its register
    /// for the result without a conflict.
    pub fn conflicts(&self, other: &LiveRange) -> bool {
        self.overlaps(other) && self.end != other.start + 1 && other.end != self.start + 1
    }
}

/// The operation a statement performs.
#[derive(Debug, Clone, PartialEq)]
pub enum SsaKind {
    /// Load of a named variable from the variables array.
    VariableLoad {
        /// The variable's name (also its symbol-table key).
        name: String,
    },
    /// Load of a literal constant from the literals array.
    LiteralLoad {
        /// The literal's canonical textual form (its symbol-table key).
        canonical_name: String,
        /// The literal's numeric value.
        value: f64,
    },
    /// A unary operator applied to an earlier statement's value.
    UnaryOp {
        /// Which unary operator.
        op: UnOp,
        /// The operand statement.
        operand: StmtId,
    },
    /// A binary operator applied to two earlier statements' values.
    BinaryOp {
        /// Which binary operator.
        op: BinOp,
        /// Left operand statement.
        left: StmtId,
        /// Right operand statement.
        right: StmtId,
    },
    /// A call to a named library function.
    FunctionCall {
        /// Name of the called function.
        name: String,
        /// Ordered argument statements.
        args: Vec<StmtId>,
    },
    /// Write of a register-resident value to a freshly allocated stack slot.
    Spill {
        /// The statement whose value is being spilled.
        value: StmtId,
    },
    /// Read-back of a spilled or memory-resident value into a register.
    Reload {
        /// The statement being reloaded (a `Spill`, a `VariableLoad`, or a
        /// `LiteralLoad`).
        value: StmtId,
    },
    /// Reserves `size` bytes of stack space; always the first statement
    /// when present.
    StackAllocate {
        /// Total slot size in bytes, rounded up to 16.
        size: u32,
    },
}

/// One statement of the SSA.
#[derive(Debug, Clone, PartialEq)]
pub struct SsaStmt {
    /// The operation this statement performs.
    pub kind: SsaKind,
    /// This statement's live range, recomputed by each allocator pass.
    pub live_range: LiveRange,
    /// Where the allocator has placed this statement's value, if any.
    pub loc: Option<MemLoc>,
}

/// An ordered sequence of [`SsaStmt`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ssa {
    statements: Vec<SsaStmt>,
}

impl Ssa {
    /// Build an [`Ssa`] directly from a statement vector. Used by the
    /// register allocator to materialize a rewritten program after
    /// inserting spill and reload statements.
    pub(crate) fn from_statements(statements: Vec<SsaStmt>) -> Self {
        Ssa { statements }
    }

    /// All statements, in program order.
    pub fn statements(&self) -> &[SsaStmt] {
        &self.statements
    }

    /// Mutable access to all statements, in program order.
    pub fn statements_mut(&mut self) -> &mut Vec<SsaStmt> {
        &mut self.statements
    }

    /// Number of statements.
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Whether the SSA has no statements.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// The statement that produces the expression's final result, i.e. the
    /// last statement in program order.
    pub fn result(&self) -> StmtId {
        debug_assert!(!self.statements.is_empty());
        (self.statements.len() - 1) as StmtId
    }

    fn push(&mut self, kind: SsaKind, loc: Option<MemLoc>) -> StmtId {
        let id = self.statements.len() as StmtId;
        self.statements.push(SsaStmt {
            kind,
            live_range: LiveRange::point(id),
            loc,
        });
        id
    }

    /// The operand statement ids a statement consumes, in left-to-right
    /// order. Used by live-range computation and by the register allocator.
    pub fn operands_of(&self, id: StmtId) -> Vec<StmtId> {
        match &self.statements[id as usize].kind {
            SsaKind::VariableLoad { .. }
            | SsaKind::LiteralLoad { .. }
            | SsaKind::StackAllocate { .. } => Vec::new(),
            SsaKind::UnaryOp { operand, .. } => vec![*operand],
            SsaKind::BinaryOp { left, right, .. } => vec![*left, *right],
            SsaKind::FunctionCall { args, .. } => args.clone(),
            SsaKind::Spill { value } | SsaKind::Reload { value } => vec![*value],
        }
    }

    /// Recompute every statement's live range from scratch. Re-run at the
    /// start of every allocator pass.
    ///
    /// For a straight-line program a single linear pass suffices: each
    /// statement starts with a self-use range, then every later use widens
    /// its operands' ranges to include the position of that use.
    pub fn compute_live_ranges(&mut self) {
        let n = self.statements.len() as u32;
        for (i, stmt) in self.statements.iter_mut().enumerate() {
            stmt.live_range = LiveRange::point(i as u32);
        }
        for i in 0..n {
            for operand in self.operands_of(i) {
                let end = &mut self.statements[operand as usize].live_range.end;
                if i + 1 > *end {
                    *end = i + 1;
                }
            }
        }
    }
}

/// Build an [`Ssa`] from `ast`, consulting `symtable` for variable and
/// literal memory offsets.
pub fn build(ast: &Ast, symtable: &SymbolTable) -> Result<Ssa, Error> {
    let mut ssa = Ssa::default();
    build_node(ast, ast.root(), symtable, &mut ssa)?;
    Ok(ssa)
}

fn build_node(
    ast: &Ast,
    id: NodeId,
    symtable: &SymbolTable,
    ssa: &mut Ssa,
) -> Result<StmtId, Error> {
    match ast.node(id) {
        AstNode::Variable { name } => {
            let symbol = symtable.variable(name).ok_or(Error::InternalError {
                where_: "ssa::build (missing variable symbol)",
            })?;
            debug_assert_eq!(symbol.kind, SymbolKind::Variable);
            Ok(ssa.push(
                SsaKind::VariableLoad { name: name.clone() },
                Some(MemLoc::Memory(MemKind::Variables, symbol.offset() as u64)),
            ))
        }
        AstNode::Literal {
            value,
            canonical_name,
        } => {
            let symbol = symtable
                .literal(canonical_name)
                .ok_or(Error::InternalError {
                    where_: "ssa::build (missing literal symbol)",
                })?;
            Ok(ssa.push(
                SsaKind::LiteralLoad {
                    canonical_name: canonical_name.clone(),
                    value: *value,
                },
                Some(MemLoc::Memory(MemKind::Literals, symbol.offset() as u64)),
            ))
        }
        AstNode::UnaryOp { op, operand } => {
            let operand = build_node(ast, *operand, symtable, ssa)?;
            Ok(ssa.push(SsaKind::UnaryOp { op: *op, operand }, None))
        }
        AstNode::BinaryOp { op, left, right } => {
            let left = build_node(ast, *left, symtable, ssa)?;
            let right = build_node(ast, *right, symtable, ssa)?;
            Ok(ssa.push(SsaKind::BinaryOp { op: *op, left, right }, None))
        }
        AstNode::FunctionCall { name, args } => {
            let args = args
                .iter()
                .map(|arg| build_node(ast, *arg, symtable, ssa))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ssa.push(
                SsaKind::FunctionCall {
                    name: name.clone(),
                    args,
                },
                None,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::lex;
    use crate::parse::parse;
    use crate::symtab::collect;

    fn build_str(src: &str) -> Ssa {
        let tokens = lex(src).unwrap();
        let ast = parse(&tokens).unwrap();
        let symtable = collect(&ast).unwrap();
        build(&ast, &symtable).unwrap()
    }

    #[test]
    fn every_operand_precedes_its_statement() {
        let ssa = build_str("(a + b) * (c - 1.0)");
        for (i, _) in ssa.statements().iter().enumerate() {
            for operand in ssa.operands_of(i as StmtId) {
                assert!(operand < i as StmtId, "operand {operand} used at or after {i}");
            }
        }
    }

    #[test]
    fn live_ranges_widen_to_last_use() {
        let mut ssa = build_str("a + a");
        ssa.compute_live_ranges();
        // statement 0 is the VariableLoad for the first `a`; it isn't used
        // until statement 2 (the BinaryOp), so its range must widen past
        // the intervening load of the second `a` at position 1.
        let a_range = ssa.statements()[0].live_range;
        pretty_assertions::assert_eq!(a_range, LiveRange { start: 0, end: 3 });
    }

    #[test]
    fn result_is_the_last_statement() {
        let ssa = build_str("a + b");
        assert_eq!(ssa.result() as usize, ssa.len() - 1);
    }
}
