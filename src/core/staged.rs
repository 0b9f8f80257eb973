//! Staged combination of one visit.
//!
//! The passes run strictly in order; each consumes the geometry or the
//! quality masks left by the one before:
//!
//! ```text
//! Uninitialized → TotalCoarse → FrameLocked → FilterProducts
//!               → TotalRefined → SingleExposureProducts → Done
//! ```
//!
//! Any fatal error moves the machine to `Failed`. Filter and
//! single-exposure items fail individually and are reported as warnings.

use crate::config::{PipelineConfig, SkyMethod};
use crate::core::classify::ClassifiedObset;
use crate::core::drizzle::{CombineOptions, CombineRequest, DrizzleCombiner, OutputGeometry};
use crate::core::quality_mask::{flag_rejected, ResetBits, DEFAULT_EXTNAME};
use crate::types::{
    CombinedProduct, Exposure, Extension, ExtensionVersion, MaskProvenance, MosaicError,
    MosaicResult, ObsetGroup, ProductKind, ReferenceFrame,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Position of the staged combiner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    Uninitialized,
    TotalCoarse,
    FrameLocked,
    FilterProducts,
    TotalRefined,
    SingleExposureProducts,
    Done,
    Failed,
}

impl PipelineState {
    /// State reached by the next successful transition
    pub fn next(self) -> Option<PipelineState> {
        match self {
            PipelineState::Uninitialized => Some(PipelineState::TotalCoarse),
            PipelineState::TotalCoarse => Some(PipelineState::FrameLocked),
            PipelineState::FrameLocked => Some(PipelineState::FilterProducts),
            PipelineState::FilterProducts => Some(PipelineState::TotalRefined),
            PipelineState::TotalRefined => Some(PipelineState::SingleExposureProducts),
            PipelineState::SingleExposureProducts => Some(PipelineState::Done),
            PipelineState::Done | PipelineState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::TotalCoarse => "total-coarse",
            PipelineState::FrameLocked => "frame-locked",
            PipelineState::FilterProducts => "filter-products",
            PipelineState::TotalRefined => "total-refined",
            PipelineState::SingleExposureProducts => "single-exposure-products",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// An item left out of the outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemWarning {
    /// Pass that excluded the item (`None` for alignment)
    pub state: Option<PipelineState>,
    /// Exposure id or group label
    pub item: String,
    pub reason: String,
}

impl fmt::Display for ItemWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            Some(state) => write!(f, "[{}] {}: {}", state, self.item, self.reason),
            None => write!(f, "[alignment] {}: {}", self.item, self.reason),
        }
    }
}

/// Fatal error and where it struck
#[derive(Debug)]
pub struct PipelineFailure {
    pub last_completed: PipelineState,
    /// Transition target that could not be reached
    pub failed_during: PipelineState,
    pub error: MosaicError,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed during {} (last completed: {}): {}",
            self.failed_during, self.last_completed, self.error
        )
    }
}

/// Products of a visit, one per label.
///
/// Inserting a product whose label is already present replaces it.
#[derive(Debug, Clone, Default)]
pub struct ProductSet {
    total: Option<CombinedProduct>,
    filters: BTreeMap<String, CombinedProduct>,
    singles: BTreeMap<String, CombinedProduct>,
}

impl ProductSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `product`, returning the one it replaces
    pub fn insert(&mut self, product: CombinedProduct) -> Option<CombinedProduct> {
        match product.kind {
            ProductKind::Total => self.total.replace(product),
            ProductKind::Filter => self.filters.insert(product.label.clone(), product),
            ProductKind::SingleExposure => self.singles.insert(product.label.clone(), product),
        }
    }

    pub fn total(&self) -> Option<&CombinedProduct> {
        self.total.as_ref()
    }

    pub fn filter(&self, label: &str) -> Option<&CombinedProduct> {
        self.filters.get(label)
    }

    pub fn single(&self, label: &str) -> Option<&CombinedProduct> {
        self.singles.get(label)
    }

    pub fn filters(&self) -> impl Iterator<Item = &CombinedProduct> {
        self.filters.values()
    }

    pub fn singles(&self) -> impl Iterator<Item = &CombinedProduct> {
        self.singles.values()
    }

    /// Total first, then filters, then single exposures
    pub fn iter(&self) -> impl Iterator<Item = &CombinedProduct> {
        self.total.iter().chain(self.filters.values()).chain(self.singles.values())
    }

    pub fn len(&self) -> usize {
        self.total.iter().count() + self.filters.len() + self.singles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

/// Everything a finished (or failed) run leaves behind
#[derive(Debug)]
pub struct PipelineReport {
    pub state: PipelineState,
    pub products: ProductSet,
    pub frame: Option<Arc<ReferenceFrame>>,
    pub warnings: Vec<ItemWarning>,
    pub failure: Option<PipelineFailure>,
}

impl PipelineReport {
    pub fn status(&self) -> RunStatus {
        if self.failure.is_some() || self.state != PipelineState::Done {
            RunStatus::Failed
        } else if self.warnings.is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::SucceededWithWarnings
        }
    }

    /// Ids / labels of every excluded item, sorted and unique
    pub fn excluded(&self) -> Vec<String> {
        let mut items: Vec<String> = self.warnings.iter().map(|w| w.item.clone()).collect();
        items.sort();
        items.dedup();
        items
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "state: {}, products: {}, warnings: {}",
            self.state,
            self.products.len(),
            self.warnings.len()
        );
        if let Some(failure) = &self.failure {
            text.push_str(&format!(", {}", failure));
        }
        text
    }
}

#[cfg(feature = "parallel")]
fn run_items<T, R, F>(parallel: bool, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    use rayon::prelude::*;
    if parallel {
        items.par_iter().map(f).collect()
    } else {
        items.iter().map(f).collect()
    }
}

#[cfg(not(feature = "parallel"))]
fn run_items<T, R, F>(_parallel: bool, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    items.iter().map(f).collect()
}

/// Quality planes and mask provenance of one exposure before a pass edits them
struct MaskSnapshot {
    quality: Vec<Extension>,
    provenance: Option<MaskProvenance>,
}

impl MaskSnapshot {
    fn take(exposure: &Exposure) -> Self {
        Self {
            quality: quality_extensions(exposure).cloned().collect(),
            provenance: exposure.provenance.clone(),
        }
    }

    fn quality_unchanged(&self, exposure: &Exposure) -> bool {
        quality_extensions(exposure).eq(self.quality.iter())
    }

    /// Put planes and provenance back as they were
    fn restore(self, exposure: &mut Exposure) {
        let mut saved = self.quality.into_iter();
        for ext in exposure
            .extensions
            .iter_mut()
            .filter(|ext| ext.matches(DEFAULT_EXTNAME, ExtensionVersion::All))
        {
            if let Some(original) = saved.next() {
                *ext = original;
            }
        }
        exposure.provenance = self.provenance;
    }
}

fn quality_extensions(exposure: &Exposure) -> impl Iterator<Item = &Extension> {
    exposure
        .extensions
        .iter()
        .filter(|ext| ext.matches(DEFAULT_EXTNAME, ExtensionVersion::All))
}

/// One group's combination job
struct Job<'g, 'e> {
    group: &'g ObsetGroup,
    exposures: Vec<&'e Exposure>,
}

/// Drives the combination passes of one visit
pub struct StagedCombiner<'a, C: DrizzleCombiner + ?Sized> {
    combiner: &'a C,
    config: &'a PipelineConfig,
    state: PipelineState,
    frame: Option<Arc<ReferenceFrame>>,
    products: ProductSet,
    previous: ProductSet,
    warnings: Vec<ItemWarning>,
    failure: Option<PipelineFailure>,
}

impl<'a, C: DrizzleCombiner + ?Sized> StagedCombiner<'a, C> {
    pub fn new(combiner: &'a C, config: &'a PipelineConfig) -> Self {
        Self {
            combiner,
            config,
            state: PipelineState::Uninitialized,
            frame: None,
            products: ProductSet::new(),
            previous: ProductSet::new(),
            warnings: Vec::new(),
            failure: None,
        }
    }

    /// Seed warnings raised before combination (alignment failures)
    pub fn with_warnings(mut self, warnings: Vec<ItemWarning>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Products of an earlier run; single-exposure products whose inputs'
    /// masks have not changed since are reused instead of regenerated
    pub fn with_previous(mut self, previous: ProductSet) -> Self {
        self.previous = previous;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn frame(&self) -> Option<&Arc<ReferenceFrame>> {
        self.frame.as_ref()
    }

    pub fn products(&self) -> &ProductSet {
        &self.products
    }

    pub fn warnings(&self) -> &[ItemWarning] {
        &self.warnings
    }

    pub fn failure(&self) -> Option<&PipelineFailure> {
        self.failure.as_ref()
    }

    /// Run every remaining transition and hand back the report
    pub fn run(mut self, obset: &ClassifiedObset, exposures: &mut [Exposure]) -> PipelineReport {
        while !self.state.is_terminal() {
            self.step(obset, exposures);
        }
        self.into_report()
    }

    /// Perform the next transition; returns the new state
    pub fn step(&mut self, obset: &ClassifiedObset, exposures: &mut [Exposure]) -> PipelineState {
        let Some(target) = self.state.next() else {
            return self.state;
        };

        let result = match target {
            PipelineState::TotalCoarse => self.total_coarse(obset, exposures),
            PipelineState::FrameLocked => self.lock_frame(),
            PipelineState::FilterProducts => self.filter_products(obset, exposures),
            PipelineState::TotalRefined => self.total_refined(obset, exposures),
            PipelineState::SingleExposureProducts => self.single_exposure_products(obset, exposures),
            PipelineState::Done => {
                log::info!("🏁 Visit complete: {} products", self.products.len());
                Ok(())
            }
            PipelineState::Uninitialized | PipelineState::Failed => Ok(()),
        };

        match result {
            Ok(()) => {
                log::debug!("Transition {} → {}", self.state, target);
                self.state = target;
            }
            Err(error) => {
                log::error!("❌ Pipeline failed during {}: {}", target, error);
                self.failure = Some(PipelineFailure {
                    last_completed: self.state,
                    failed_during: target,
                    error,
                });
                self.state = PipelineState::Failed;
            }
        }
        self.state
    }

    pub fn into_report(self) -> PipelineReport {
        PipelineReport {
            state: self.state,
            products: self.products,
            frame: self.frame,
            warnings: self.warnings,
            failure: self.failure,
        }
    }

    fn warn(&mut self, state: PipelineState, item: &str, reason: String) {
        log::warn!("⚠️  [{}] excluding {}: {}", state, item, reason);
        self.warnings.push(ItemWarning {
            state: Some(state),
            item: item.to_string(),
            reason,
        });
    }

    /// Aligned members of a group; unaligned or unknown ones are warned once
    fn usable<'e>(
        &mut self,
        state: PipelineState,
        exposures: &'e [Exposure],
        members: &[String],
    ) -> Vec<&'e Exposure> {
        let mut usable = Vec::with_capacity(members.len());
        for id in members {
            let reason = match exposures.iter().find(|e| e.id == *id) {
                Some(exposure) if exposure.solution.is_some() => {
                    usable.push(exposure);
                    continue;
                }
                Some(_) => "not aligned",
                None => "exposure not loaded",
            };
            if !self.warnings.iter().any(|w| w.item == *id) {
                self.warn(state, id, reason.to_string());
            }
        }
        usable
    }

    fn locked_frame(&self) -> MosaicResult<Arc<ReferenceFrame>> {
        self.frame
            .clone()
            .ok_or_else(|| MosaicError::Processing("Reference frame has not been locked".to_string()))
    }

    fn options(&self, rejection: bool, sky_method: SkyMethod, fill_value: Option<f32>) -> CombineOptions {
        CombineOptions {
            rejection,
            sky_method,
            fill_value,
            good_bits: self.config.good_bits,
            cr_snr: self.config.cr_snr,
            cr_noise_floor: self.config.cr_noise_floor,
        }
    }

    /// Pass 1: all total exposures, no rejection, neutral geometry
    fn total_coarse(&mut self, obset: &ClassifiedObset, exposures: &[Exposure]) -> MosaicResult<()> {
        let total = obset.total();
        log::info!("🔭 Coarse total pass over {} exposures", total.members.len());

        let inputs = self.usable(PipelineState::TotalCoarse, exposures, &total.members);
        if inputs.is_empty() {
            return Err(MosaicError::TotalPipelineFailure {
                state: PipelineState::TotalCoarse.to_string(),
                reason: "no aligned exposures in the total group".to_string(),
            });
        }

        let pixel_scale = self.config.scale_for(&inputs[0].detector_key());
        let geometry = OutputGeometry::Neutral { pixel_scale };
        let options = self.options(false, SkyMethod::None, None);

        let product = self.combiner.combine(&CombineRequest {
            label: &total.label,
            kind: ProductKind::Total,
            filename: &total.filename,
            exposures: &inputs,
            geometry: &geometry,
            options: &options,
        })?;
        self.products.insert(product);
        Ok(())
    }

    /// Pass 2: freeze the coarse total's grid as the visit frame
    fn lock_frame(&mut self) -> MosaicResult<()> {
        let total = self
            .products
            .total()
            .ok_or_else(|| MosaicError::FrameExtraction("no total product".to_string()))?;
        let frame = ReferenceFrame::from_product(total)?;

        log::info!(
            "🔒 Frame locked: {}x{} at {:.4}\"/pix, rotation {:.3}°, {}",
            frame.shape().0,
            frame.shape().1,
            frame.pixel_scale(),
            frame.rotation(),
            frame.wcs_name()
        );
        self.frame = Some(Arc::new(frame));
        Ok(())
    }

    /// Pass 3: one product per filter group on the locked frame
    fn filter_products(&mut self, obset: &ClassifiedObset, exposures: &[Exposure]) -> MosaicResult<()> {
        let frame = self.locked_frame()?;
        let geometry = OutputGeometry::Locked(frame.clone());
        let options = self.options(true, self.config.sky_method, Some(self.config.filter_fill_value));

        let mut jobs = Vec::new();
        for group in obset.filter_groups() {
            let inputs = self.usable(PipelineState::FilterProducts, exposures, &group.members);
            if inputs.is_empty() {
                self.warn(
                    PipelineState::FilterProducts,
                    &group.label,
                    "no aligned exposures".to_string(),
                );
                continue;
            }
            jobs.push(Job { group, exposures: inputs });
        }
        log::info!("🎨 Filter pass: {} group(s)", jobs.len());

        let combiner = self.combiner;
        let results = run_items(self.config.parallel, &jobs, |job| {
            combiner.combine(&CombineRequest {
                label: &job.group.label,
                kind: ProductKind::Filter,
                filename: &job.group.filename,
                exposures: &job.exposures,
                geometry: &geometry,
                options: &options,
            })
        });

        for (job, result) in jobs.iter().zip(results) {
            match result {
                Ok(product) if frame.matches(&product.grid) => {
                    self.products.insert(product);
                }
                Ok(_) => self.warn(
                    PipelineState::FilterProducts,
                    &job.group.label,
                    "product grid differs from the locked frame".to_string(),
                ),
                Err(e) => self.warn(PipelineState::FilterProducts, &job.group.label, e.to_string()),
            }
        }
        Ok(())
    }

    /// Pass 4: re-arm cosmic-ray bits, then re-combine the total with rejection
    fn total_refined(&mut self, obset: &ClassifiedObset, exposures: &mut [Exposure]) -> MosaicResult<()> {
        let total = obset.total();
        let pass = PipelineState::TotalRefined.to_string();

        let mut snapshots: BTreeMap<String, MaskSnapshot> = exposures
            .iter()
            .filter(|e| total.members.contains(&e.id))
            .map(|e| (e.id.clone(), MaskSnapshot::take(e)))
            .collect();

        let product = match self.refine_total(total, &pass, exposures) {
            Ok(product) => product,
            Err(e) => {
                let mut restored = 0;
                for exposure in exposures.iter_mut() {
                    if let Some(snapshot) = snapshots.remove(&exposure.id) {
                        snapshot.restore(exposure);
                        restored += 1;
                    }
                }
                log::warn!(
                    "Refined total failed, restored the quality planes of {} exposure(s)",
                    restored
                );
                return Err(e);
            }
        };

        // A mask that ends up as it started keeps its provenance
        for exposure in exposures.iter_mut() {
            if let Some(snapshot) = snapshots.remove(&exposure.id) {
                if snapshot.quality_unchanged(exposure) && exposure.provenance != snapshot.provenance {
                    log::debug!("{}: quality planes unchanged by {}", exposure.id, pass);
                    exposure.provenance = snapshot.provenance;
                }
            }
        }

        if self.products.insert(product).is_some() {
            log::debug!("Refined total supersedes the coarse total");
        }
        Ok(())
    }

    /// Clear, combine and flag; the caller rolls the masks back on error
    fn refine_total(
        &mut self,
        total: &ObsetGroup,
        pass: &str,
        exposures: &mut [Exposure],
    ) -> MosaicResult<CombinedProduct> {
        let frame = self.locked_frame()?;

        // Every clear completes before any exposure is read again
        let planes = ResetBits::new(self.config.cr_bits)
            .for_pass(pass)
            .apply_to_members(exposures, &total.members)?;
        log::info!(
            "🧹 Cleared bits {} in {} quality plane(s) before the refined total",
            self.config.cr_bits,
            planes
        );

        let product = {
            let inputs = self.usable(PipelineState::TotalRefined, exposures, &total.members);
            if inputs.is_empty() {
                return Err(MosaicError::TotalPipelineFailure {
                    state: pass.to_string(),
                    reason: "no aligned exposures in the total group".to_string(),
                });
            }
            let geometry = OutputGeometry::Locked(frame.clone());
            let options = self.options(true, self.config.sky_method, Some(self.config.filter_fill_value));
            self.combiner.combine(&CombineRequest {
                label: &total.label,
                kind: ProductKind::Total,
                filename: &total.filename,
                exposures: &inputs,
                geometry: &geometry,
                options: &options,
            })?
        };

        if !frame.matches(&product.grid) {
            return Err(MosaicError::Processing(format!(
                "refined {} grid {:?} differs from the locked frame {:?}",
                product.label,
                product.grid,
                frame.grid()
            )));
        }

        let flagged = flag_rejected(exposures, &product.rejection, self.config.cr_bits, pass)?;
        log::info!("Flagged {} cosmic-ray pixels in the exposures", flagged);
        Ok(product)
    }

    /// Pass 5: every exposure alone on the locked frame with its refined mask
    fn single_exposure_products(&mut self, obset: &ClassifiedObset, exposures: &[Exposure]) -> MosaicResult<()> {
        let frame = self.locked_frame()?;
        let geometry = OutputGeometry::Locked(frame.clone());
        let options = self.options(false, self.config.sky_method, Some(self.config.single_fill_value));

        let groups: Vec<&ObsetGroup> = obset.single_groups().collect();
        let mut jobs = Vec::new();
        let mut produced = 0;
        for group in groups.iter().copied() {
            let inputs = self.usable(PipelineState::SingleExposureProducts, exposures, &group.members);
            let Some(exposure) = inputs.first().copied() else {
                continue;
            };

            let tag = exposure.filter_tag();
            if group.filter_tag.as_deref() != Some(tag.as_str()) {
                log::warn!(
                    "{}: exposure filter tag {} disagrees with group tag {:?}",
                    group.label,
                    tag,
                    group.filter_tag
                );
            }

            let reusable = self.previous.single(&group.label).filter(|previous| {
                frame.matches(&previous.grid)
                    && previous.mask_sequences.get(&exposure.id) == Some(&exposure.mask_sequence())
            });
            if let Some(previous) = reusable {
                log::info!("♻️  Reusing {}: mask unchanged since it was made", group.label);
                self.products.insert(previous.clone());
                produced += 1;
                continue;
            }
            jobs.push(Job { group, exposures: inputs });
        }
        log::info!("🖼️  Single-exposure pass: {} to combine", jobs.len());

        let combiner = self.combiner;
        let results = run_items(self.config.parallel, &jobs, |job| {
            combiner.combine(&CombineRequest {
                label: &job.group.label,
                kind: ProductKind::SingleExposure,
                filename: &job.group.filename,
                exposures: &job.exposures,
                geometry: &geometry,
                options: &options,
            })
        });

        for (job, result) in jobs.iter().zip(results) {
            match result {
                Ok(product) if frame.matches(&product.grid) => {
                    self.products.insert(product);
                    produced += 1;
                }
                Ok(_) => self.warn(
                    PipelineState::SingleExposureProducts,
                    &job.group.label,
                    "product grid differs from the locked frame".to_string(),
                ),
                Err(e) => self.warn(PipelineState::SingleExposureProducts, &job.group.label, e.to_string()),
            }
        }

        if produced == 0 && !groups.is_empty() {
            return Err(MosaicError::TotalPipelineFailure {
                state: PipelineState::SingleExposureProducts.to_string(),
                reason: format!("all {} single-exposure products failed", groups.len()),
            });
        }
        Ok(())
    }
}
