//! Code tracking and sample resolution

pub mod code_entry;
pub mod code_map;
pub mod generator;
