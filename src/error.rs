//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::lex::Span;

/// A position in the original source text, in bytes.
pub type Position = usize;

/// Errors raised while turning source characters into tokens.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("lex error at {position}: {reason}")]
pub struct LexError {
    /// Byte offset of the offending character.
    pub position: Position,
    /// Human-readable description.
    pub reason: String,
}

/// Errors raised while parsing a token stream into an AST.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// A literal contained more than one decimal point, or otherwise failed
    /// to parse as a number.
    #[error("bad literal {text:?} at {span:?}")]
    BadLiteral {
        /// The offending lexeme.
        text: String,
        /// Location of the lexeme.
        span: Span,
    },
    /// A token appeared where a factor (literal, symbol, call, or
    /// parenthesised expression) was expected.
    #[error("unexpected token {found:?} at {span:?}")]
    UnexpectedToken {
        /// What was found instead.
        found: String,
        /// Location of the token.
        span: Span,
    },
    /// A `(` was never closed, or a stray `)` appeared.
    #[error("unbalanced parentheses at {span:?}")]
    UnbalancedParens {
        /// Location of the offending paren.
        span: Span,
    },
    /// The token stream ended while a factor or operator was still expected.
    #[error("unexpected end of input")]
    UnexpectedEof,
}

/// Top-level error type returned by every fallible operation in the
/// compilation pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The host platform has no ABI descriptor implemented for it.
    #[error("unsupported platform")]
    UnsupportedPlatform,
    /// The host ISA (instruction set architecture) is not targeted by the
    /// backend.
    #[error("unsupported instruction set architecture")]
    UnsupportedIsa,
    /// Propagated from the lexer.
    #[error(transparent)]
    Lex(#[from] LexError),
    /// Propagated from the parser.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// A name is used both as a variable and as a called function within the
    /// same expression.
    #[error("{name:?} is used as both a variable and a function")]
    SymbolCollision {
        /// The colliding name.
        name: String,
    },
    /// A call site has more floating-point arguments than the ABI's
    /// argument-register file provides.
    #[error("call to {function:?} has more than {limit} arguments")]
    TooManyArgs {
        /// Name of the called function.
        function: String,
        /// Maximum number of fp argument registers for the active ABI.
        limit: usize,
    },
    /// The relocator could not resolve a called function's address.
    #[error("unknown function {name:?}")]
    UnknownSymbol {
        /// The unresolved symbol name.
        name: String,
    },
    /// A write was attempted against a page that already transitioned to
    /// executable.
    #[error("attempted to write to a locked executable page")]
    WriteToLocked,
    /// A `Rel32` relocation's displacement did not fit in 32 bits.
    #[error("relocation displacement out of range for {symbol:?}")]
    RelocationOutOfRange {
        /// The symbol whose relocation overflowed.
        symbol: String,
    },
    /// An internal invariant was violated; indicates a bug in this crate
    /// rather than a malformed expression.
    #[error("internal error in {where_}")]
    InternalError {
        /// Which component detected the violation.
        where_: &'static str,
    },
}

/// Convenience alias for fallible pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
