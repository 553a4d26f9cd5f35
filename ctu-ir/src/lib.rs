#![forbid(unsafe_code)]

pub mod ir;
pub mod order;

pub use ir::*;
pub use order::*;
