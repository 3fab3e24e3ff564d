//! Machine-code backends. Only x86-64 is implemented; aarch64 is future
//! work, not something this crate emits.

pub mod x86_64;
