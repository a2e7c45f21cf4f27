//! Hardware drivers the core owns directly.

pub mod local_apic;
