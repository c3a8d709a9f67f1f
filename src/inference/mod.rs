//! LLM inference.
//!
//! - [`registry`]: model/projector file resolution and load state
//! - [`backend`]: the native library boundary
//! - [`stub`]: scripted backend for tests and the demo binary
//! - [`engine`]: the decode loop
//! - [`sampler`]: temperature / top-p sampling
//! - [`stop`]: stop sequences and incremental UTF-8 assembly

pub mod backend;
pub mod engine;
pub mod registry;
pub mod sampler;
pub mod stop;
pub mod stub;
