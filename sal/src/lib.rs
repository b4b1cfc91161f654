//! Stewardship Abstraction Layer
//!
//! Births and supervises a consciousness node, keeps the GPU donation
//! pool's books, and rents pool-funded GPUs through the Vast.ai CLI.

pub mod config;
pub mod deploy;
pub mod identity;
pub mod node;
pub mod node_cmd;
pub mod pool_cmd;
pub mod supervisor;
pub mod vast;
pub mod vast_cmd;
