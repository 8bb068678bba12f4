pub mod chain;
pub mod common;
pub mod consensus;
pub mod network;
