//! Spatial decomposition: Morton codec, bounding boxes and octree builder.
pub mod build;
pub mod constants;
pub mod domain;
pub mod helpers;
pub mod morton;
pub mod types;
