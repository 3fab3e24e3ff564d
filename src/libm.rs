//! Math function registry.
//!
//! The original C++ exposes scalar, vec2 and vec4 variants of each
//! function; the vec2/vec4 entry points are `MATHEXPR_NOT_IMPLEMENTED`
//! stubs there, and this crate's scalar-only language drops them entirely
//! rather than carry the stub surface forward.

use std::collections::HashMap;

use crate::abi::Abi;
use crate::ast::{Ast, AstNode, NodeId};
use crate::error::Error;

extern "C" fn wrap_abs(x: f64) -> f64 {
    x.abs()
}

extern "C" fn wrap_sqrt(x: f64) -> f64 {
    x.sqrt()
}

extern "C" fn wrap_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn wrap_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn wrap_tan(x: f64) -> f64 {
    x.tan()
}

extern "C" fn wrap_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn wrap_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn wrap_floor(x: f64) -> f64 {
    x.floor()
}

extern "C" fn wrap_ceil(x: f64) -> f64 {
    x.ceil()
}

extern "C" fn wrap_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn wrap_min(x: f64, y: f64) -> f64 {
    x.min(y)
}

extern "C" fn wrap_max(x: f64, y: f64) -> f64 {
    x.max(y)
}

extern "C" fn wrap_atan2(x: f64, y: f64) -> f64 {
    x.atan2(y)
}

/// One registered function: its native address and expected arity.
#[derive(Debug, Clone, Copy)]
struct Entry {
    address: u64,
    arity: usize,
}

/// The set of scalar library functions callable from a compiled
/// expression. Each is a thin `extern "C"` wrapper around a `std` method,
/// guaranteeing a real SystemV/Windows-x64-callable symbol rather than an
/// inlined intrinsic with no stable address.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: HashMap<&'static str, Entry>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut entries = HashMap::new();
        macro_rules! register {
            ($name:literal, $f:expr, $arity:literal) => {
                entries.insert(
                    $name,
                    Entry {
                        address: $f as usize as u64,
                        arity: $arity,
                    },
                );
            };
        }
        register!("abs", wrap_abs, 1);
        register!("sqrt", wrap_sqrt, 1);
        register!("sin", wrap_sin, 1);
        register!("cos", wrap_cos, 1);
        register!("tan", wrap_tan, 1);
        register!("exp", wrap_exp, 1);
        register!("ln", wrap_ln, 1);
        register!("floor", wrap_floor, 1);
        register!("ceil", wrap_ceil, 1);
        register!("pow", wrap_pow, 2);
        register!("min", wrap_min, 2);
        register!("max", wrap_max, 2);
        register!("atan2", wrap_atan2, 2);
        Registry { entries }
    }
}

impl Registry {
    /// Native entry-point address of a registered function, if any.
    pub fn address(&self, name: &str) -> Option<u64> {
        self.entries.get(name).map(|e| e.address)
    }

    /// Declared arity of a registered function, if any.
    pub fn arity(&self, name: &str) -> Option<usize> {
        self.entries.get(name).map(|e| e.arity)
    }
}

/// Check every function call in `ast` against `registry` and `abi`'s
/// call-argument register budget.
pub fn validate_calls(ast: &Ast, registry: &Registry, abi: &dyn Abi) -> Result<(), Error> {
    visit(ast, ast.root(), registry, abi)
}

fn visit(ast: &Ast, id: NodeId, registry: &Registry, abi: &dyn Abi) -> Result<(), Error> {
    match ast.node(id) {
        AstNode::Variable { .. } | AstNode::Literal { .. } => Ok(()),
        AstNode::UnaryOp { operand, .. } => visit(ast, *operand, registry, abi),
        AstNode::BinaryOp { left, right, .. } => {
            visit(ast, *left, registry, abi)?;
            visit(ast, *right, registry, abi)
        }
        AstNode::FunctionCall { name, args } => {
            for arg in args {
                visit(ast, *arg, registry, abi)?;
            }
            if args.len() > abi.max_call_fp_args() {
                return Err(Error::TooManyArgs {
                    function: name.clone(),
                    limit: abi.max_call_fp_args(),
                });
            }
            let arity = registry.arity(name).ok_or_else(|| Error::UnknownSymbol {
                name: name.clone(),
            })?;
            if arity != args.len() {
                return Err(Error::UnknownSymbol { name: name.clone() });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::SystemV;
    use crate::lex::lex;
    use crate::parse::parse;

    fn validate_str(src: &str) -> Result<(), Error> {
        let tokens = lex(src).unwrap();
        let ast = parse(&tokens).unwrap();
        validate_calls(&ast, &Registry::default(), &SystemV)
    }

    #[test]
    fn known_function_with_matching_arity_is_accepted() {
        assert!(validate_str("pow(a, 2.0)").is_ok());
    }

    #[test]
    fn unknown_function_is_rejected() {
        assert_eq!(
            validate_str("frobnicate(a)"),
            Err(Error::UnknownSymbol {
                name: "frobnicate".to_string()
            })
        );
    }

    #[test]
    fn wrong_arity_is_rejected() {
        assert_eq!(
            validate_str("sqrt(a, b)"),
            Err(Error::UnknownSymbol {
                name: "sqrt".to_string()
            })
        );
    }

    #[test]
    fn registry_addresses_are_nonzero() {
        let registry = Registry::default();
        assert!(registry.address("sqrt").unwrap() != 0);
    }
}
