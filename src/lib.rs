/// Packaging settings baked in at build time
pub mod build_config;
pub mod build_env;
/// Timing of full passes over a trace
pub mod profile;

pub use profile::{Timing, profile};
