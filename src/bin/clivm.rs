//! Command-line front end for the JIT compiler.

use clap::{Parser, ValueEnum};
use mathjit::abi;
use mathjit::expr::{dump, DebugStage, Expr};

/// Compile and evaluate a scalar arithmetic expression.
#[derive(Debug, Parser)]
#[command(name = "clivm", version, about)]
struct Cli {
    /// The expression source, e.g. "a + b * sin(c)".
    expression: String,

    /// Variable bindings as `name=value`, e.g. `a=1.0 b=2.5`.
    #[arg(value_parser = parse_binding)]
    bindings: Vec<(String, f64)>,

    /// Print an intermediate compilation stage instead of evaluating.
    #[arg(long, value_enum)]
    emit: Option<EmitStage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmitStage {
    Tokens,
    Ast,
    Symtab,
    Ssa,
    SsaAlloc,
    Asm,
    Hex,
}

impl From<EmitStage> for DebugStage {
    fn from(stage: EmitStage) -> Self {
        match stage {
            EmitStage::Tokens => DebugStage::Tokens,
            EmitStage::Ast => DebugStage::Ast,
            EmitStage::Symtab => DebugStage::SymTab,
            EmitStage::Ssa => DebugStage::Ssa,
            EmitStage::SsaAlloc => DebugStage::SsaAlloc,
            EmitStage::Asm => DebugStage::Asm,
            EmitStage::Hex => DebugStage::Hex,
        }
    }
}

fn parse_binding(text: &str) -> Result<(String, f64), String> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {text:?}"))?;
    let value: f64 = value
        .parse()
        .map_err(|_| format!("{value:?} is not a valid number"))?;
    Ok((name.to_string(), value))
}

fn run(cli: Cli) -> mathjit::Result<()> {
    let abi = abi::host_abi()?;

    if let Some(stage) = cli.emit {
        let text = dump(&cli.expression, abi.as_ref(), stage.into())?;
        println!("{text}");
        return Ok(());
    }

    let expr = Expr::compile(&cli.expression)?;
    let bindings: std::collections::HashMap<String, f64> = cli.bindings.into_iter().collect();
    let result = expr.call_named(&bindings)?;
    println!("{result}");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
