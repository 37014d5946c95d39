//! Runledger - thread store, checkpoints, tool scheduling and memory
//! extraction for agent runs

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod ids;
pub mod memory;
pub mod tools;

pub use error::{StoreError, StoreResult};
