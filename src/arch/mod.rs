//! Architecture-specific code. Only `amd64` is implemented; the module
//! boundary exists so a second architecture could be added the way the
//! teacher pack's multi-arch kernels do, without the core caring.

pub mod amd64;
