use crate::types::{AstrometricSolution, Exposure, MosaicError, MosaicResult};
use std::collections::BTreeMap;

/// Per-exposure outcome of a visit alignment
pub type AlignmentResults = BTreeMap<String, MosaicResult<AstrometricSolution>>;

/// Computes one consistent astrometric solution per exposure of a visit
pub trait Aligner: Sync {
    fn align(&self, exposures: &[Exposure]) -> AlignmentResults;
}

/// Aligner that adopts each exposure's header WCS as its visit solution.
///
/// Exposures without a valid header WCS fail alignment.
#[derive(Debug, Clone)]
pub struct HeaderWcsAligner {
    /// Frame name; solutions are named `FIT-VISIT-<frame>`
    pub frame: String,
}

impl Default for HeaderWcsAligner {
    fn default() -> Self {
        Self { frame: "GAIADR2".to_string() }
    }
}

impl Aligner for HeaderWcsAligner {
    fn align(&self, exposures: &[Exposure]) -> AlignmentResults {
        let name = format!("FIT-VISIT-{}", self.frame);
        exposures
            .iter()
            .map(|exposure| {
                let result = match &exposure.header_wcs {
                    Some(wcs) if wcs.is_valid() => Ok(AstrometricSolution {
                        name: name.clone(),
                        ..wcs.clone()
                    }),
                    Some(_) => Err(MosaicError::Alignment {
                        exposure: exposure.id.clone(),
                        reason: "header WCS is not valid".to_string(),
                    }),
                    None => Err(MosaicError::Alignment {
                        exposure: exposure.id.clone(),
                        reason: "no header WCS".to_string(),
                    }),
                };
                (exposure.id.clone(), result)
            })
            .collect()
    }
}

/// Apply alignment results; returns `(exposure id, reason)` of failures.
///
/// A failed exposure keeps `solution == None` and is left out of every
/// combination pass.
pub fn apply_alignment(exposures: &mut [Exposure], mut results: AlignmentResults) -> Vec<(String, String)> {
    let mut failures = Vec::new();
    for exposure in exposures.iter_mut() {
        match results.remove(&exposure.id) {
            Some(Ok(solution)) => {
                log::debug!("Aligned {} to {}", exposure.id, solution.name);
                exposure.solution = Some(solution);
            }
            Some(Err(e)) => {
                log::warn!("⚠️  Excluding {}: {}", exposure.id, e);
                exposure.solution = None;
                failures.push((exposure.id.clone(), e.to_string()));
            }
            None => {
                log::warn!("⚠️  Excluding {}: no alignment result", exposure.id);
                exposure.solution = None;
                failures.push((exposure.id.clone(), "no alignment result".to_string()));
            }
        }
    }
    failures
}
