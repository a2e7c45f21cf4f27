//! Architecture-specific hardware operations.
//!
//! Every inline-assembly primitive the core uses lives under this module,
//! one implementation per target architecture. Functions compile to host
//! no-ops outside the kernel target so the protocol logic above this layer
//! can be unit-tested with `cargo test`.

pub mod x86_64;
