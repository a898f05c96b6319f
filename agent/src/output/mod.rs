//! Profile exporters

pub mod json;
pub mod text;
