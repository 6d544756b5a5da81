//! County choropleth pipeline: boundaries and a keyed attribute table in,
//! a styled map out, either as a hosted tileset or a self-contained page.

pub mod config;
pub mod data;
pub mod download;
pub mod error;
pub mod export;
pub mod join;
pub mod page;
pub mod pipeline;
pub mod publish;
pub mod server;
pub mod simplify;
pub mod style;
pub mod tiles;
pub mod types;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineReport};
