//! Compilation façade wiring lex -> parse -> symbol table -> SSA ->
//! regalloc -> codegen -> relocation -> executable memory, and gating
//! intermediate dumps behind a typed debug-stage selector.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::abi::{self, Abi};
use crate::backend::x86_64;
use crate::error::Error;
use crate::execmem::ExecMem;
use crate::isel;
use crate::lex::lex;
use crate::libm::{self, Registry};
use crate::link;
use crate::parse::parse;
use crate::regalloc;
use crate::ssa;
use crate::symtab::{self, SymbolTable};

/// A compiled expression: a locked executable page plus the metadata
/// needed to call it.
pub struct Expr {
    exec: ExecMem,
    variable_names: Vec<String>,
    literal_values: Vec<f64>,
}

impl Expr {
    /// Compile `source` for the host platform's ABI.
    pub fn compile(source: &str) -> Result<Self, Error> {
        let abi = abi::host_abi()?;
        Self::compile_for_abi(source, abi.as_ref())
    }

    /// Compile `source` for an explicitly chosen ABI. Exposed so tests and
    /// the CLI can exercise a non-host ABI's encoding.
    pub fn compile_for_abi(source: &str, abi: &dyn Abi) -> Result<Self, Error> {
        let registry = Registry::default();
        let (symtable, mut ssa) = build_ssa(source, &registry, abi)?;
        regalloc::allocate(&mut ssa, abi)?;
        let instrs = isel::select(&ssa, &symtable, abi)?;
        let (mut code, relocations) = x86_64::emit(&instrs, abi);

        let mut exec = ExecMem::new(code.len())?;
        link::relocate(&mut code, &relocations, exec.address(), &registry)?;
        exec.write(&code)?;
        exec.lock()?;

        debug!(bytes = code.len(), "expression compiled");

        let variable_names = symtable.variables().iter().map(|s| s.name.clone()).collect();
        let literal_values = symtable.literals().iter().map(|s| s.value.unwrap()).collect();

        Ok(Expr {
            exec,
            variable_names,
            literal_values,
        })
    }

    /// Variable names, in the order [`Expr::call`] expects their values.
    pub fn variable_names(&self) -> &[String] {
        &self.variable_names
    }

    /// Evaluate the compiled expression against positional variable values.
    pub fn call(&self, variables: &[f64]) -> f64 {
        assert_eq!(
            variables.len(),
            self.variable_names.len(),
            "wrong number of variable values"
        );
        let f = self
            .exec
            .as_function()
            .expect("a successfully compiled Expr always holds a locked page");
        f(variables.as_ptr(), self.literal_values.as_ptr())
    }

    /// Evaluate the compiled expression against named variable values.
    pub fn call_named(&self, values: &HashMap<String, f64>) -> Result<f64, Error> {
        let mut ordered = Vec::with_capacity(self.variable_names.len());
        for name in &self.variable_names {
            let value = values.get(name).ok_or_else(|| Error::UnknownSymbol {
                name: name.clone(),
            })?;
            ordered.push(*value);
        }
        Ok(self.call(&ordered))
    }
}

fn build_ssa(source: &str, registry: &Registry, abi: &dyn Abi) -> Result<(SymbolTable, ssa::Ssa), Error> {
    let tokens = lex(source)?;
    debug!(count = tokens.len(), "lexed");
    let ast = parse(&tokens)?;
    debug!("parsed");
    let symtable = symtab::collect(&ast)?;
    debug!(
        variables = symtable.variables().len(),
        literals = symtable.literals().len(),
        "collected symbols"
    );
    libm::validate_calls(&ast, registry, abi)?;
    let ssa = ssa::build(&ast, &symtable)?;
    debug!(statements = ssa.len(), "built SSA");
    Ok((symtable, ssa))
}

/// Which intermediate stage [`dump`] should render, replacing the
/// original's `ExprPrintFlags_*` bitflags with a typed selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugStage {
    /// Raw token stream.
    Tokens,
    /// Parenthesised AST pretty-print.
    Ast,
    /// Variable and literal symbol tables.
    SymTab,
    /// SSA statements before register allocation.
    Ssa,
    /// SSA statements after register allocation.
    SsaAlloc,
    /// Selected abstract instructions.
    Asm,
    /// Final relocated machine code, as hex.
    Hex,
}

/// Render `source` up to `stage`, without producing a callable [`Expr`].
/// Backs the CLI's `--emit` flag.
pub fn dump(source: &str, abi: &dyn Abi, stage: DebugStage) -> Result<String, Error> {
    let registry = Registry::default();

    if stage == DebugStage::Tokens {
        let tokens = lex(source)?;
        return Ok(tokens
            .iter()
            .map(|t| format!("{:?} {:?}", t.kind, t.text))
            .collect::<Vec<_>>()
            .join("\n"));
    }

    let tokens = lex(source)?;
    let ast = parse(&tokens)?;
    if stage == DebugStage::Ast {
        return Ok(ast.pretty_print());
    }

    let symtable = symtab::collect(&ast)?;
    if stage == DebugStage::SymTab {
        let mut out = String::new();
        for symbol in symtable.variables() {
            let _ = writeln!(out, "var {} = [{}]", symbol.name, symbol.offset());
        }
        for symbol in symtable.literals() {
            let _ = writeln!(
                out,
                "lit {} = {:?} [{}]",
                symbol.name,
                symbol.value,
                symbol.offset()
            );
        }
        return Ok(out);
    }

    libm::validate_calls(&ast, &registry, abi)?;
    let mut ssa = ssa::build(&ast, &symtable)?;
    if stage == DebugStage::Ssa {
        return Ok(dump_ssa(&ssa));
    }

    regalloc::allocate(&mut ssa, abi)?;
    if stage == DebugStage::SsaAlloc {
        return Ok(dump_ssa(&ssa));
    }

    let instrs = isel::select(&ssa, &symtable, abi)?;
    if stage == DebugStage::Asm {
        let call_save_bytes = if instrs.iter().any(|i| matches!(i, isel::Instr::Call { .. })) {
            x86_64::CALL_SAVE_BYTES
        } else {
            0
        };
        return Ok(instrs
            .iter()
            .map(|i| {
                format!(
                    "{:?}\n    {}  ({} bytes est.)",
                    i,
                    x86_64::disassemble(i, abi, call_save_bytes),
                    x86_64::get_bytecode_size_estimate(i)
                )
            })
            .collect::<Vec<_>>()
            .join("\n"));
    }

    let (mut code, relocations) = x86_64::emit(&instrs, abi);
    let exec = ExecMem::new(code.len())?;
    link::relocate(&mut code, &relocations, exec.address(), &registry)?;
    Ok(code.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" "))
}

fn dump_ssa(ssa: &ssa::Ssa) -> String {
    let mut out = String::new();
    for (i, stmt) in ssa.statements().iter().enumerate() {
        let _ = writeln!(
            out,
            "%{i} = {:?} [{:?}..{:?}) @ {:?}",
            stmt.kind, stmt.live_range.start, stmt.live_range.end, stmt.loc
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::SystemV;

    #[test]
    fn compiles_and_evaluates_a_simple_expression() {
        let expr = Expr::compile_for_abi("a + b * c", &SystemV).unwrap();
        assert_eq!(expr.variable_names(), &["a".to_string(), "b".to_string(), "c".to_string()]);
        let result = expr.call(&[1.0, 2.0, 3.0]);
        assert_eq!(result, 1.0 + 2.0 * 3.0);
    }

    #[test]
    fn call_named_matches_positional_call() {
        let expr = Expr::compile_for_abi("x - y", &SystemV).unwrap();
        let mut values = HashMap::new();
        values.insert("x".to_string(), 10.0);
        values.insert("y".to_string(), 4.0);
        assert_eq!(expr.call_named(&values).unwrap(), 6.0);
    }

    #[test]
    fn literals_are_baked_in_at_compile_time() {
        let expr = Expr::compile_for_abi("a * 2.0", &SystemV).unwrap();
        assert_eq!(expr.call(&[21.0]), 42.0);
    }

    #[test]
    fn library_call_round_trips_through_the_compiled_function() {
        let expr = Expr::compile_for_abi("sqrt(a)", &SystemV).unwrap();
        assert_eq!(expr.call(&[16.0]), 4.0);
    }

    #[test]
    fn negation_flips_the_sign() {
        let expr = Expr::compile_for_abi("-a", &SystemV).unwrap();
        assert_eq!(expr.call(&[3.5]), -3.5);
    }

    #[test]
    fn high_register_pressure_expression_still_evaluates_correctly() {
        let expr =
            Expr::compile_for_abi("a+(b+(c+(d+(e+(f+(g+(h+(i+j))))))))", &SystemV).unwrap();
        let values: Vec<f64> = (1..=10).map(|n| n as f64).collect();
        assert_eq!(expr.call(&values), values.iter().sum::<f64>());
    }

    #[test]
    fn dump_asm_mentions_a_call_instruction() {
        let text = dump("pow(a, 2.0)", &SystemV, DebugStage::Asm).unwrap();
        assert!(text.contains("Call"));
    }

    #[test]
    fn dump_hex_is_nonempty() {
        let text = dump("a + b", &SystemV, DebugStage::Hex).unwrap();
        assert!(!text.is_empty());
    }
}
