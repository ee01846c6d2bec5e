//! Agent-based model of immunity acquired by infection and vaccination and
//! lost by waning.

pub mod config;
pub mod data;
pub mod engine;
pub mod fit;
pub mod immunity;
pub mod manager;
pub mod model;
pub mod results;
pub mod series;
pub mod variant;
pub mod waning;
