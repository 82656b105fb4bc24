use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod catalog;
pub mod common;
pub mod config;
pub mod discovery;
pub mod partitioner;
pub mod sampler;
pub mod vocab;
