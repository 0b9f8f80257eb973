use crate::config::{PipelineConfig, ProcessOptions};
use crate::core::align::{apply_alignment, Aligner};
use crate::core::classify::ClassifiedObset;
use crate::core::drizzle::DrizzleCombiner;
use crate::core::staged::{ItemWarning, PipelineReport, PipelineState, ProductSet, RunStatus, StagedCombiner};
use crate::types::{Exposure, MosaicError, MosaicResult, ProductKind, ReferenceFrame};
use std::sync::Arc;

/// What downstream member-product generation receives
pub struct CatalogRequest<'a> {
    pub products: &'a ProductSet,
    pub frame: &'a Arc<ReferenceFrame>,
    pub mosaic: bool,
    pub cell: bool,
}

/// Builds catalogs and tiled outputs from the finished products
pub trait CatalogGenerator: Sync {
    fn generate(&self, request: &CatalogRequest<'_>) -> MosaicResult<()>;
}

/// Collaborators of one visit run
pub struct Collaborators<'a> {
    pub aligner: &'a dyn Aligner,
    pub combiner: &'a dyn DrizzleCombiner,
    pub catalog: Option<&'a dyn CatalogGenerator>,
}

/// Outcome of a visit as seen by the caller
#[derive(Debug)]
pub struct ObsetRun {
    pub report: PipelineReport,
    pub options: ProcessOptions,
    /// Whether downstream generation ran and succeeded
    pub catalog_generated: bool,
    /// Error of a downstream generation that ran and failed
    pub catalog_error: Option<MosaicError>,
}

impl ObsetRun {
    pub fn status(&self) -> RunStatus {
        self.report.status()
    }

    pub fn frame(&self) -> Option<&Arc<ReferenceFrame>> {
        self.report.frame.as_ref()
    }

    pub fn warnings(&self) -> &[ItemWarning] {
        &self.report.warnings
    }
}

/// Locate the total group, align, run every combination pass and hand the
/// result on to member-product generation.
///
/// A missing total group is an error; every later failure, a failed
/// catalog generation included, is reported in the returned run rather
/// than as `Err`.
pub fn process_obset(
    obset: &ClassifiedObset,
    exposures: &mut [Exposure],
    collaborators: &Collaborators<'_>,
    config: &PipelineConfig,
    options: ProcessOptions,
) -> MosaicResult<ObsetRun> {
    process_obset_with_previous(obset, exposures, collaborators, config, options, ProductSet::new())
}

/// [`process_obset`] with the products of an earlier run of the same visit
pub fn process_obset_with_previous(
    obset: &ClassifiedObset,
    exposures: &mut [Exposure],
    collaborators: &Collaborators<'_>,
    config: &PipelineConfig,
    options: ProcessOptions,
    previous: ProductSet,
) -> MosaicResult<ObsetRun> {
    let total = obset.total();
    if total.kind != ProductKind::Total {
        return Err(MosaicError::NoTotalProduct { found: 0 });
    }
    log::info!(
        "🚀 Processing obset {}/{}: {} ({} exposures, {} groups)",
        obset.visit.proposal_id,
        obset.visit.obset_id,
        total.filename,
        total.members.len(),
        obset.groups().len()
    );
    log::info!("Switches: mosaic={}, cell={}", options.mosaic, options.cell);

    let results = collaborators.aligner.align(exposures);
    let warnings = apply_alignment(exposures, results)
        .into_iter()
        .map(|(item, reason)| ItemWarning { state: None, item, reason })
        .collect();

    let report = StagedCombiner::new(collaborators.combiner, config)
        .with_warnings(warnings)
        .with_previous(previous)
        .run(obset, exposures);

    let mut catalog_generated = false;
    let mut catalog_error = None;
    match (&report.frame, report.state) {
        (Some(frame), PipelineState::Done) => {
            if let Some(catalog) = collaborators.catalog {
                let request = CatalogRequest {
                    products: &report.products,
                    frame,
                    mosaic: options.mosaic,
                    cell: options.cell,
                };
                // The combined products stand on their own
                match catalog.generate(&request) {
                    Ok(()) => catalog_generated = true,
                    Err(e) => {
                        log::error!("❌ Catalog generation failed: {}", e);
                        catalog_error = Some(e);
                    }
                }
            }
            log::info!("✅ Obset finished: {}", report.summary());
        }
        _ => {
            log::error!("❌ Obset failed: {}", report.summary());
        }
    }
    for warning in &report.warnings {
        log::warn!("⚠️  {}", warning);
    }

    Ok(ObsetRun {
        report,
        options,
        catalog_generated,
        catalog_error,
    })
}
