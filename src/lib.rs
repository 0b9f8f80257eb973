//! visit-mosaic: staged single-visit mosaic combination
//!
//! Combines the exposures of one telescope visit into a hierarchy of
//! co-registered products: one total mosaic, one product per filter and one
//! cosmic-ray cleaned product per exposure, all on a single reference grid
//! fixed by the first pass over the total.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use crate::types::{
    AstrometricSolution, CombinedProduct, Exposure, ExtensionVersion, GridGeometry, MosaicError,
    MosaicResult, ObsetGroup, ProductKind, QualityBitSet, ReferenceFrame,
};

pub use crate::config::{PipelineConfig, ProcessOptions, SkyMethod};
pub use crate::io::{ExposureFile, UpdateHandle};
pub use crate::core::{classify, process_obset, reset_bits, ResetBits, StagedCombiner};
