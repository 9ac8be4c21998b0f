//! 领域实体定义

pub mod todo;

pub use todo::*;
