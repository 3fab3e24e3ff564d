//! Relocation application.
//!
//! The emitter leaves placeholder bytes at every call site and at every
//! `Neg` lowering's mask reference, recorded as a [`Relocation`]. This
//! module patches them once the code buffer's final address is known, the
//! last step before the page transitions to executable.

use crate::error::Error;
use crate::libm::Registry;

/// How a relocation's placeholder bytes should be patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// An 8-byte little-endian absolute address.
    Abs64,
    /// A 4-byte little-endian displacement, relative to the byte
    /// immediately following the 4-byte field.
    Rel32,
}

/// What a relocation's target address resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationTarget {
    /// The native address of a registered library function.
    Function(String),
    /// The address of this crate's negation sign-bit mask constant.
    NegSignMask,
}

/// One pending patch against the emitted code buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset within the code buffer where the placeholder begins.
    pub offset: usize,
    /// How to interpret and patch the placeholder.
    pub kind: RelocationKind,
    /// What address the placeholder should resolve to.
    pub target: RelocationTarget,
}

/// 128-bit, 16-byte-aligned because `xorpd`'s memory form faults on a
/// misaligned operand. Only the low qword (the sign bit of a scalar
/// double) is meaningful; the high qword is zero so flipping it is a
/// no-op on whatever garbage occupies an xmm register's upper lane.
#[repr(align(16))]
struct SignMask([u64; 2]);

static NEG_SIGN_MASK: SignMask = SignMask([0x8000_0000_0000_0000, 0]);

fn neg_sign_mask_address() -> u64 {
    (&NEG_SIGN_MASK as *const SignMask) as u64
}

fn target_name(target: &RelocationTarget) -> String {
    match target {
        RelocationTarget::Function(name) => name.clone(),
        RelocationTarget::NegSignMask => "__neg_sign_mask".to_string(),
    }
}

/// Patch every relocation in `relocations` into `code`, which must already
/// reside at its final address `code_base` (required for `Rel32`'s
/// self-relative math).
pub fn relocate(
    code: &mut [u8],
    relocations: &[Relocation],
    code_base: u64,
    registry: &Registry,
) -> Result<(), Error> {
    for reloc in relocations {
        let target_addr = match &reloc.target {
            RelocationTarget::Function(name) => {
                registry.address(name).ok_or_else(|| Error::UnknownSymbol {
                    name: name.clone(),
                })?
            }
            RelocationTarget::NegSignMask => neg_sign_mask_address(),
        };

        match reloc.kind {
            RelocationKind::Abs64 => {
                code[reloc.offset..reloc.offset + 8].copy_from_slice(&target_addr.to_le_bytes());
            }
            RelocationKind::Rel32 => {
                let site_end = code_base + reloc.offset as u64 + 4;
                let disp = target_addr as i64 - site_end as i64;
                let disp32 = i32::try_from(disp).map_err(|_| Error::RelocationOutOfRange {
                    symbol: target_name(&reloc.target),
                })?;
                code[reloc.offset..reloc.offset + 4].copy_from_slice(&disp32.to_le_bytes());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs64_patches_little_endian_bytes() {
        let mut code = vec![0u8; 8];
        let registry = Registry::default();
        let relocations = vec![Relocation {
            offset: 0,
            kind: RelocationKind::Abs64,
            target: RelocationTarget::Function("sqrt".to_string()),
        }];
        relocate(&mut code, &relocations, 0x1000, &registry).unwrap();
        let patched = u64::from_le_bytes(code.try_into().unwrap());
        assert_eq!(patched, registry.address("sqrt").unwrap());
    }

    #[test]
    fn rel32_is_relative_to_the_end_of_the_field() {
        let mut code = vec![0u8; 4];
        let registry = Registry::default();
        let target = registry.address("sqrt").unwrap();
        let code_base = target.wrapping_sub(100);
        let relocations = vec![Relocation {
            offset: 0,
            kind: RelocationKind::Rel32,
            target: RelocationTarget::Function("sqrt".to_string()),
        }];
        relocate(&mut code, &relocations, code_base, &registry).unwrap();
        let disp = i32::from_le_bytes(code.try_into().unwrap());
        assert_eq!(code_base as i64 + 4 + disp as i64, target as i64);
    }

    #[test]
    fn unknown_function_is_rejected() {
        let mut code = vec![0u8; 8];
        let registry = Registry::default();
        let relocations = vec![Relocation {
            offset: 0,
            kind: RelocationKind::Abs64,
            target: RelocationTarget::Function("nope".to_string()),
        }];
        assert!(matches!(
            relocate(&mut code, &relocations, 0, &registry),
            Err(Error::UnknownSymbol { .. })
        ));
    }

    #[test]
    fn neg_sign_mask_resolves_to_a_real_aligned_address() {
        let mut code = vec![0u8; 8];
        let registry = Registry::default();
        let relocations = vec![Relocation {
            offset: 0,
            kind: RelocationKind::Abs64,
            target: RelocationTarget::NegSignMask,
        }];
        relocate(&mut code, &relocations, 0, &registry).unwrap();
        let addr = u64::from_le_bytes(code.try_into().unwrap());
        assert_eq!(addr % 16, 0);
    }
}
