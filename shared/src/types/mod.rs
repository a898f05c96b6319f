//! Data records shared across Aperture crates

pub mod events;
pub mod profile;
