//! End-to-end compilation and execution, covering the scenario table a
//! production JIT for this language is expected to handle: arithmetic
//! precedence, unary negation, parentheses, library calls, and a
//! deliberately register-pressured expression.
//!
//! Gated to x86-64: this crate has no other backend to execute.

#![cfg(target_arch = "x86_64")]

use mathjit::Expr;

fn eval(src: &str, values: &[f64]) -> f64 {
    Expr::compile(src).unwrap().call(values)
}

#[test]
fn addition_and_subtraction_are_left_associative() {
    assert_eq!(eval("a - b - c", &[10.0, 3.0, 2.0]), 10.0 - 3.0 - 2.0);
}

#[test]
fn multiplication_binds_tighter_than_addition() {
    assert_eq!(eval("a + b * c", &[1.0, 2.0, 3.0]), 1.0 + 2.0 * 3.0);
}

#[test]
fn parentheses_override_precedence() {
    assert_eq!(eval("(a + b) * c", &[1.0, 2.0, 3.0]), (1.0 + 2.0) * 3.0);
}

#[test]
fn unary_minus_applies_before_multiplication() {
    assert_eq!(eval("-a * b", &[2.0, 5.0]), -2.0 * 5.0);
}

#[test]
fn nested_library_calls_evaluate_correctly() {
    let result = eval("sqrt(pow(a, 2.0) + pow(b, 2.0))", &[3.0, 4.0]);
    assert!((result - 5.0).abs() < 1e-9);
}

#[test]
fn repeated_variable_uses_share_one_memory_slot() {
    // `a` appears three times; the compiled function must read the same
    // caller-supplied slot each time, not drift across separate loads.
    assert_eq!(eval("a + a * a", &[3.0]), 3.0 + 3.0 * 3.0);
}

#[test]
fn high_register_pressure_expression_still_computes_the_right_answer() {
    let src = "a+(b+(c+(d+(e+(f+(g+(h+(i+(j+(k+l))))))))))";
    let values: Vec<f64> = (1..=12).map(|n| n as f64).collect();
    let expected: f64 = values.iter().sum();
    assert_eq!(eval(src, &values), expected);
}

#[test]
fn value_surviving_a_call_is_not_clobbered_by_the_callee() {
    // `c * d` must still be live once `pow` returns; if it isn't spilled
    // across the call, `pow`'s body is free to overwrite its register.
    assert_eq!(eval("(c * d) + pow(a, b)", &[2.0, 3.0, 2.0, 3.0]), (2.0 * 3.0) + 2.0f64.powf(3.0));
}

#[test]
fn a_later_variable_load_survives_a_call_that_clobbers_its_base_pointer() {
    // `sin`/`cos`/`pow`/`atan2` all touch `rdi`/`rsi` (System V) internally;
    // `b`'s load happens after the call, so it must read through the
    // restored base pointer, not a pointer the callee was free to trash.
    assert_eq!(eval("sin(a) + b", &[2.0, 100.0]), 2.0f64.sin() + 100.0);
    assert_eq!(eval("cos(a) * b", &[1.0, 2.0]), 1.0f64.cos() * 2.0);
}

#[test]
fn division_and_negative_literals_compute_correctly() {
    assert_eq!(eval("a / b - 1.0", &[10.0, 4.0]), 10.0 / 4.0 - 1.0);
}

#[test]
fn compiling_twice_yields_independently_callable_functions() {
    let first = Expr::compile("a * 2.0").unwrap();
    let second = Expr::compile("a + 1.0").unwrap();
    assert_eq!(first.call(&[21.0]), 42.0);
    assert_eq!(second.call(&[41.0]), 42.0);
}

#[test]
fn unknown_function_name_is_rejected_before_any_code_is_generated() {
    assert!(Expr::compile("frobnicate(a)").is_err());
}

#[test]
fn variable_used_as_a_function_name_is_a_symbol_collision() {
    let err = Expr::compile("f + f(1.0)").unwrap_err();
    assert!(matches!(err, mathjit::Error::SymbolCollision { .. }));
}
