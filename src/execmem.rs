//! Executable memory page.
//!
//! A page starts life writable, accepts the emitted machine code, then
//! makes a one-shot transition to executable. Writing after that
//! transition is a typed error rather than undefined behavior.

use crate::error::Error;

/// The compiled expression's call signature: two pointers to the caller's
/// variables and literals arrays, returning the result.
pub type CompiledFn = extern "C" fn(*const f64, *const f64) -> f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Writable,
    Executable,
}

/// An anonymous, page-backed memory mapping that can hold and then execute
/// machine code.
#[derive(Debug)]
pub struct ExecMem {
    ptr: *mut u8,
    len: usize,
    written: usize,
    state: State,
}

// The mapping is exclusively owned by this struct; no interior mutability
// is exposed beyond what `&mut self` already requires.
unsafe impl Send for ExecMem {}

impl ExecMem {
    /// Map `len` bytes of fresh, writable, non-executable memory.
    pub fn new(len: usize) -> Result<Self, Error> {
        let len = len.max(1);
        let ptr = platform::map_writable(len)?;
        Ok(ExecMem {
            ptr,
            len,
            written: 0,
            state: State::Writable,
        })
    }

    /// The mapping's base address. Valid for the lifetime of `self`,
    /// including after [`ExecMem::lock`], since the transition changes
    /// protection bits rather than the mapping's address.
    pub fn address(&self) -> u64 {
        self.ptr as u64
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.written
    }

    /// Whether any bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Append `bytes` to the mapping. Errors with [`Error::WriteToLocked`]
    /// once [`ExecMem::lock`] has run.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.state != State::Writable {
            return Err(Error::WriteToLocked);
        }
        if self.written + bytes.len() > self.len {
            return Err(Error::InternalError {
                where_: "execmem::ExecMem::write (capacity exceeded)",
            });
        }
        // SAFETY: `self.ptr` is a live mapping of at least `self.len` bytes
        // and `self.written + bytes.len() <= self.len` was just checked.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(self.written), bytes.len());
        }
        self.written += bytes.len();
        Ok(())
    }

    /// Overwrite previously written bytes in place, used by the linker to
    /// patch relocations before the page is locked.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        if self.state != State::Writable {
            return Err(Error::WriteToLocked);
        }
        if offset + bytes.len() > self.written {
            return Err(Error::InternalError {
                where_: "execmem::ExecMem::patch (out of written range)",
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    /// The bytes written so far, as a slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: bytes [0, written) were all initialized by `write`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.written) }
    }

    /// One-shot transition to executable, read-only memory. Idempotent.
    pub fn lock(&mut self) -> Result<(), Error> {
        if self.state == State::Executable {
            return Ok(());
        }
        platform::make_executable(self.ptr, self.len)?;
        self.state = State::Executable;
        Ok(())
    }

    /// Obtain the compiled function. Only sound to call after [`ExecMem::lock`]
    /// succeeds; returns `None` otherwise.
    pub fn as_function(&self) -> Option<CompiledFn> {
        if self.state != State::Executable {
            return None;
        }
        // SAFETY: the caller's emitted bytes are a complete function body
        // per the `CompiledFn` signature, and the page is executable.
        Some(unsafe { std::mem::transmute::<*mut u8, CompiledFn>(self.ptr) })
    }
}

impl Drop for ExecMem {
    fn drop(&mut self) {
        platform::unmap(self.ptr, self.len);
    }
}

#[cfg(unix)]
mod platform {
    use crate::error::Error;

    pub(super) fn map_writable(len: usize) -> Result<*mut u8, Error> {
        // SAFETY: a fixed, well-formed set of mmap arguments requesting an
        // anonymous private mapping; the result is checked for MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::InternalError {
                where_: "execmem::platform::map_writable (mmap failed)",
            });
        }
        Ok(ptr as *mut u8)
    }

    pub(super) fn make_executable(ptr: *mut u8, len: usize) -> Result<(), Error> {
        // SAFETY: `ptr`/`len` describe the live mapping created by
        // `map_writable`.
        let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(Error::InternalError {
                where_: "execmem::platform::make_executable (mprotect failed)",
            });
        }
        Ok(())
    }

    pub(super) fn unmap(ptr: *mut u8, len: usize) {
        // SAFETY: `ptr`/`len` describe a mapping owned solely by the
        // `ExecMem` being dropped.
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, len);
        }
    }
}

#[cfg(windows)]
mod platform {
    use crate::error::Error;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };

    pub(super) fn map_writable(len: usize) -> Result<*mut u8, Error> {
        // SAFETY: a fixed, well-formed set of VirtualAlloc arguments
        // requesting a fresh committed, writable region.
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(Error::InternalError {
                where_: "execmem::platform::map_writable (VirtualAlloc failed)",
            });
        }
        Ok(ptr as *mut u8)
    }

    pub(super) fn make_executable(ptr: *mut u8, len: usize) -> Result<(), Error> {
        let mut old_protect = 0u32;
        // SAFETY: `ptr`/`len` describe the live mapping created by
        // `map_writable`.
        let ok = unsafe {
            VirtualProtect(
                ptr as *const core::ffi::c_void,
                len,
                PAGE_EXECUTE_READ,
                &mut old_protect,
            )
        };
        if ok == 0 {
            return Err(Error::InternalError {
                where_: "execmem::platform::make_executable (VirtualProtect failed)",
            });
        }
        Ok(())
    }

    pub(super) fn unmap(ptr: *mut u8, _len: usize) {
        // SAFETY: `ptr` is a mapping owned solely by the `ExecMem` being
        // dropped; `MEM_RELEASE` requires a size of 0.
        unsafe {
            VirtualFree(ptr as *mut core::ffi::c_void, 0, MEM_RELEASE);
        }
    }
}
