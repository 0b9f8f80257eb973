//! Visit processing: mask editing, grouping, alignment and combination

pub mod quality_mask;
pub mod classify;
pub mod align;
pub mod drizzle;
pub mod staged;
pub mod orchestrator;

// Re-export main types
pub use quality_mask::{reset_bits, flag_rejected, ResetBits};
pub use classify::{classify, parse_rootname, ClassifiedObset, ExposureMeta, NamingConvention, ObsetInput, VisitInfo};
pub use align::{apply_alignment, Aligner, AlignmentResults, HeaderWcsAligner};
pub use drizzle::{CombineOptions, CombineRequest, DrizzleCombiner, OutputGeometry, PointKernelCombiner};
pub use staged::{ItemWarning, PipelineFailure, PipelineReport, PipelineState, ProductSet, RunStatus, StagedCombiner};
pub use orchestrator::{process_obset, process_obset_with_previous, CatalogGenerator, CatalogRequest, Collaborators, ObsetRun};
