//! Architecture-specific stack-switch and breakpoint primitives.
//!
//! Everything polymorphic about the restorer across architectures lives
//! here as a `#[cfg]` gate on a single binary, not as a trait or any other
//! runtime dispatch mechanism — the register conventions and instruction
//! mnemonics differ per ISA, but exactly one of these modules is ever
//! compiled in, so there is nothing to dispatch on at runtime.

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod imp;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod imp;

#[cfg(target_arch = "x86")]
#[path = "x86.rs"]
mod imp;

#[cfg(target_arch = "arm")]
#[path = "arm.rs"]
mod imp;

pub use imp::{breakpoint, switch_stack_and_call};
