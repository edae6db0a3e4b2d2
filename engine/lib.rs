#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod config;
pub mod grid_search;
pub mod permutation;
pub mod pipeline;
pub mod progress;
pub mod regression;
pub mod types;
pub mod voxel_filter;
pub mod zmap;

#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../volume/mod.rs"]
pub mod volume;

#[path = "../cohort/mod.rs"]
pub mod cohort;
