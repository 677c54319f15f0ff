//! Step ordering

pub mod resolver;
