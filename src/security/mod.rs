//! Security primitives shared by the permission layer and network tools.

pub mod dangerous;
pub mod ssrf;

pub use dangerous::DangerousCommandFilter;
