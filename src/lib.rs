//! Synthetic modal datasets of vibrating convex plates

pub mod config;
pub mod dataset;
pub mod datatypes;
pub mod error;
pub mod material;
pub mod mesher;
pub mod modal;
pub mod post_processor;
pub mod renderer;
pub mod shape;
pub mod solver;
