//! Architecture-specific context switching
//!
//! Provides assembly implementations for saving and restoring registers
//! when control moves between the loop and a continuation.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("Unsupported architecture");
    }
}
