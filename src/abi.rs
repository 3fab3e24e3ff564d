//! Platform ABI descriptors.
//!
//! Each supported platform gets a concrete struct implementing [`Abi`],
//! constructed explicitly by [`host_abi`] rather than registered into a
//! process-wide table.

use crate::error::Error;

/// A general-purpose x86-64 register, used only to describe which GPR
/// holds a base pointer; the allocator and instruction selector otherwise
/// operate entirely on floating-point registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpRegister {
    /// `rax`
    Rax,
    /// `rcx`
    Rcx,
    /// `rdx`
    Rdx,
    /// `rsi`
    Rsi,
    /// `rdi`
    Rdi,
    /// `rbp`
    Rbp,
    /// `rsp`
    Rsp,
}

impl GpRegister {
    /// The 3-bit encoding used in ModR/M and SIB bytes. None of the
    /// registers this crate names require a REX.B extension bit.
    pub(crate) fn encoding(self) -> u8 {
        match self {
            GpRegister::Rax => 0,
            GpRegister::Rcx => 1,
            GpRegister::Rdx => 2,
            GpRegister::Rsp => 4,
            GpRegister::Rbp => 5,
            GpRegister::Rsi => 6,
            GpRegister::Rdi => 7,
        }
    }
}

/// Per-platform constant pack consulted by the register allocator and the
/// x86-64 emitter.
pub trait Abi: std::fmt::Debug {
    /// Human-readable platform name, used in diagnostics.
    fn name(&self) -> &'static str;

    /// GPR holding the base pointer to the variables array (first
    /// argument).
    fn variable_base_ptr(&self) -> GpRegister;

    /// GPR holding the base pointer to the literals array (second
    /// argument).
    fn literal_base_ptr(&self) -> GpRegister;

    /// Scratch fp register index (0-based) used to return a call's or the
    /// expression's result.
    fn return_fp_register(&self) -> u32;

    /// Number of scratch xmm registers the allocator may use.
    fn scratch_fp_register_count(&self) -> u32;

    /// Scratch fp register indices, in argument-passing order, used to
    /// place a call's arguments.
    fn call_arg_fp_registers(&self) -> &'static [u32];

    /// Maximum number of fp arguments a call may pass.
    fn max_call_fp_args(&self) -> usize {
        self.call_arg_fp_registers().len()
    }

    /// Bytes of caller-allocated shadow space required before a call.
    fn shadow_space_bytes(&self) -> u32;

    /// Whether the prologue/epilogue maintain a traditional `rbp` frame
    /// pointer (SystemV) or not (Windows x64).
    fn uses_frame_pointer(&self) -> bool;
}

/// System V AMD64 ABI (Linux, macOS).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemV;

impl Abi for SystemV {
    fn name(&self) -> &'static str {
        "System V x86-64"
    }

    fn variable_base_ptr(&self) -> GpRegister {
        GpRegister::Rdi
    }

    fn literal_base_ptr(&self) -> GpRegister {
        GpRegister::Rsi
    }

    fn return_fp_register(&self) -> u32 {
        0
    }

    fn scratch_fp_register_count(&self) -> u32 {
        8
    }

    fn call_arg_fp_registers(&self) -> &'static [u32] {
        &[0, 1, 2, 3, 4, 5, 6, 7]
    }

    fn shadow_space_bytes(&self) -> u32 {
        0
    }

    fn uses_frame_pointer(&self) -> bool {
        true
    }
}

/// Microsoft x64 ABI (Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsX64;

impl Abi for WindowsX64 {
    fn name(&self) -> &'static str {
        "Windows x64"
    }

    fn variable_base_ptr(&self) -> GpRegister {
        GpRegister::Rcx
    }

    fn literal_base_ptr(&self) -> GpRegister {
        GpRegister::Rdx
    }

    fn return_fp_register(&self) -> u32 {
        0
    }

    fn scratch_fp_register_count(&self) -> u32 {
        6
    }

    fn call_arg_fp_registers(&self) -> &'static [u32] {
        &[0, 1, 2, 3, 4, 5]
    }

    fn shadow_space_bytes(&self) -> u32 {
        32
    }

    fn uses_frame_pointer(&self) -> bool {
        false
    }
}

/// Select the [`Abi`] matching the host the crate was built for.
///
/// There is no aarch64 backend: any non-x86-64 target yields
/// [`Error::UnsupportedIsa`].
pub fn host_abi() -> Result<Box<dyn Abi>, Error> {
    if !cfg!(target_arch = "x86_64") {
        return Err(Error::UnsupportedIsa);
    }
    if cfg!(target_os = "windows") {
        Ok(Box::new(WindowsX64))
    } else if cfg!(any(target_os = "linux", target_os = "macos")) {
        Ok(Box::new(SystemV))
    } else {
        Err(Error::UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_v_has_eight_scratch_registers() {
        let abi = SystemV;
        assert_eq!(abi.scratch_fp_register_count(), 8);
        assert_eq!(abi.max_call_fp_args(), 8);
    }

    #[test]
    fn windows_has_six_scratch_registers_and_shadow_space() {
        let abi = WindowsX64;
        assert_eq!(abi.scratch_fp_register_count(), 6);
        assert_eq!(abi.shadow_space_bytes(), 32);
    }
}
