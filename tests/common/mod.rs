#![allow(dead_code)]

pub mod harness;
pub mod stores;
pub mod strategies;

pub use harness::*;
pub use stores::*;
