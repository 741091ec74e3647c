//! [`VolumeApi`](crate::client::VolumeApi) implementations.
//!
//! The production client lives outside this crate; the in-memory backend here
//! behaves like a hypervisor for tests and dry runs.

pub mod memory;

pub use memory::MemoryBackend;
