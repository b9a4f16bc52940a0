//! Raw syscall trampolines.
//!
//! Every function here issues a `syscall` instruction directly instead of
//! calling into libc. Once the restorer has self-relocated (`mtcp-restart`'s
//! `relocate` module) and swept its own address space, any dynamically
//! linked `libc.so` mapping is gone; code that must survive past that point
//! cannot call through a libc symbol. The `libc` crate is still used
//! elsewhere in this workspace, but only for its `#[repr(C)]` constants
//! (`PROT_*`, `MAP_*`, ...), never its functions.

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod arch;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod arch;

#[cfg(target_arch = "x86")]
#[path = "x86.rs"]
mod arch;

#[cfg(target_arch = "arm")]
#[path = "arm.rs"]
mod arch;

pub use arch::{syscall1, syscall2, syscall3, syscall4, syscall5, syscall6, SYS};

/// A raw syscall return value, still in kernel `-errno` form.
///
/// Kernel convention: a return in `[-4095, -1]` is `-errno`; anything else
/// is a successful result (which, for `mmap`, is itself an address that may
/// look like a huge unsigned value when read as `isize`).
#[inline]
pub fn is_err(rc: isize) -> bool {
    (-4095..0).contains(&rc)
}
