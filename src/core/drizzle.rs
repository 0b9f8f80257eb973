use crate::config::SkyMethod;
use crate::core::quality_mask::bit_mask;
use crate::types::{
    AstrometricSolution, ChipMasks, CombinedProduct, Exposure, GridGeometry, MosaicError,
    MosaicResult, ProductKind, QualityBitSet, QualityPlane, ReferenceFrame, RejectionSummary,
    SciencePlane, normalize_ra, wrap_degrees,
};
use chrono::Utc;
use ndarray::{Array2, Zip};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Output grid requested from a combination pass
#[derive(Debug, Clone)]
pub enum OutputGeometry {
    /// Zero rotation at the given scale, extent covering every input
    Neutral { pixel_scale: f64 },
    /// Reuse a locked visit frame verbatim
    Locked(Arc<ReferenceFrame>),
}

/// Per-pass combination switches
#[derive(Debug, Clone)]
pub struct CombineOptions {
    pub rejection: bool,
    pub sky_method: SkyMethod,
    /// Value of output pixels no input covers; `None` leaves them NaN
    pub fill_value: Option<f32>,
    /// DQ bits still treated as good data
    pub good_bits: QualityBitSet,
    pub cr_snr: f32,
    pub cr_noise_floor: f32,
}

/// Everything one combination pass needs
#[derive(Debug, Clone)]
pub struct CombineRequest<'a> {
    pub label: &'a str,
    pub kind: ProductKind,
    pub filename: &'a str,
    pub exposures: &'a [&'a Exposure],
    pub geometry: &'a OutputGeometry,
    pub options: &'a CombineOptions,
}

/// Resamples and co-adds exposures onto one output grid
pub trait DrizzleCombiner: Sync {
    fn combine(&self, request: &CombineRequest<'_>) -> MosaicResult<CombinedProduct>;
}

/// One chip of an exposure and its row offset in exposure pixel space
struct Chip<'a> {
    version: u32,
    row_offset: usize,
    science: &'a SciencePlane,
    quality: Option<&'a QualityPlane>,
}

fn chips(exposure: &Exposure) -> Vec<Chip<'_>> {
    let mut row_offset = 0;
    let mut chips = Vec::new();
    for version in exposure.chip_versions() {
        if let Some(science) = exposure.science(version) {
            chips.push(Chip {
                version,
                row_offset,
                science,
                quality: exposure.quality(version),
            });
            row_offset += science.nrows();
        }
    }
    chips
}

/// Every DQ plane must cover its science plane pixel for pixel
fn check_planes(exposure: &Exposure) -> MosaicResult<()> {
    for chip in chips(exposure) {
        if let Some(dq) = chip.quality {
            if dq.dim() != chip.science.dim() {
                return Err(MosaicError::Combination(format!(
                    "{} chip {}: DQ plane is {:?} but SCI plane is {:?}",
                    exposure.id,
                    chip.version,
                    dq.dim(),
                    chip.science.dim()
                )));
            }
        }
    }
    Ok(())
}

fn is_good(chip: &Chip<'_>, row: usize, col: usize, bad_mask: u16) -> bool {
    chip.quality.map_or(true, |dq| {
        dq.get((row, col)).map_or(false, |&flags| flags & bad_mask == 0)
    })
}

/// Nearest output pixel `(row, col)` of an input pixel, if on the grid
fn map_pixel(from: &AstrometricSolution, to: &GridGeometry, x: f64, y: f64) -> Option<(usize, usize)> {
    let (ra, dec) = from.pixel_to_sky(x, y);
    let (ox, oy) = to.solution.sky_to_pixel(ra, dec);
    let (ix, iy) = (ox.round(), oy.round());
    let (rows, cols) = to.shape;
    if ix < 0.0 || iy < 0.0 || ix >= cols as f64 || iy >= rows as f64 {
        None
    } else {
        Some((iy as usize, ix as usize))
    }
}

fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    })
}

/// Grid with zero rotation at `pixel_scale` covering every chip of `exposures`
pub fn neutral_grid(exposures: &[&Exposure], pixel_scale: f64) -> MosaicResult<GridGeometry> {
    let solutions: Vec<&AstrometricSolution> = exposures
        .iter()
        .map(|e| {
            e.solution.as_ref().ok_or_else(|| {
                MosaicError::Combination(format!("{} has no astrometric solution", e.id))
            })
        })
        .collect::<MosaicResult<_>>()?;
    if solutions.is_empty() {
        return Err(MosaicError::Combination("No exposures to define a grid".to_string()));
    }

    let n = solutions.len() as f64;
    let ra0 = solutions[0].crval.0;
    let mean_offset = solutions
        .iter()
        .map(|s| wrap_degrees(s.crval.0 - ra0))
        .sum::<f64>()
        / n;
    let crval = (
        normalize_ra(ra0 + mean_offset),
        solutions.iter().map(|s| s.crval.1).sum::<f64>() / n,
    );
    let reference = AstrometricSolution {
        name: solutions[0].name.clone(),
        crval,
        crpix: (0.0, 0.0),
        pixel_scale,
        rotation: 0.0,
    };

    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for (exposure, solution) in exposures.iter().zip(&solutions) {
        for chip in chips(exposure) {
            let (rows, cols) = chip.science.dim();
            let top = chip.row_offset as f64 - 0.5;
            let bottom = (chip.row_offset + rows) as f64 - 0.5;
            let right = cols as f64 - 0.5;
            for (x, y) in [(-0.5, top), (right, top), (-0.5, bottom), (right, bottom)] {
                let (ra, dec) = solution.pixel_to_sky(x, y);
                let (px, py) = reference.sky_to_pixel(ra, dec);
                min_x = min_x.min(px);
                min_y = min_y.min(py);
                max_x = max_x.max(px);
                max_y = max_y.max(py);
            }
        }
    }

    if !min_x.is_finite() || !min_y.is_finite() {
        return Err(MosaicError::Combination(
            "Inputs carry no science pixels to define a grid".to_string(),
        ));
    }

    // Round-trip noise must not add a column or row
    let extent = |span: f64| ((span - 1e-6).ceil() as usize).max(1);
    let cols = extent(max_x - min_x);
    let rows = extent(max_y - min_y);
    log::debug!(
        "Neutral grid: {}x{} at {:.4}\"/pix around ({:.6}, {:.6})",
        rows, cols, pixel_scale, crval.0, crval.1
    );

    Ok(GridGeometry {
        solution: AstrometricSolution {
            crpix: (-min_x - 0.5, -min_y - 0.5),
            ..reference
        },
        shape: (rows, cols),
    })
}

/// One exposure resampled onto the output grid
struct Layer {
    values: SciencePlane,
    weight: f32,
}

/// Reference combiner with a nearest-pixel ("point") kernel.
///
/// Each good input pixel lands on the output pixel nearest its centre;
/// pixels from one exposure landing together are averaged. With rejection
/// on and at least two inputs, a pixel exceeding the per-pixel median by
/// `cr_snr` times the expected noise is rejected and reported back as an
/// input-pixel mask.
#[derive(Debug, Clone, Default)]
pub struct PointKernelCombiner;

impl PointKernelCombiner {
    pub fn new() -> Self {
        Self
    }

    fn sky_level(exposure: &Exposure, bad_mask: u16) -> f32 {
        let mut values: Vec<f32> = Vec::new();
        for chip in chips(exposure) {
            for ((row, col), &value) in chip.science.indexed_iter() {
                if value.is_finite() && is_good(&chip, row, col, bad_mask) {
                    values.push(value);
                }
            }
        }
        median(&mut values).unwrap_or(0.0)
    }

    /// Amount subtracted from each input under `method`
    fn sky_offsets(exposures: &[&Exposure], method: SkyMethod, bad_mask: u16) -> Vec<f32> {
        if method == SkyMethod::None {
            return vec![0.0; exposures.len()];
        }
        let skies: Vec<f32> = exposures.iter().map(|e| Self::sky_level(e, bad_mask)).collect();
        let lowest = skies.iter().copied().fold(f32::INFINITY, f32::min);
        for (exposure, sky) in exposures.iter().zip(&skies) {
            log::debug!("Sky of {}: {:.4}", exposure.id, sky);
        }
        skies
            .iter()
            .map(|sky| match method {
                SkyMethod::None => 0.0,
                SkyMethod::GlobalMin => lowest,
                SkyMethod::Match => sky - lowest,
                SkyMethod::MatchGlobalMin => *sky,
            })
            .collect()
    }

    fn resample(
        exposure: &Exposure,
        solution: &AstrometricSolution,
        grid: &GridGeometry,
        bad_mask: u16,
        sky: f32,
    ) -> Layer {
        let mut sum = Array2::<f32>::zeros(grid.shape);
        let mut count = Array2::<f32>::zeros(grid.shape);

        for chip in chips(exposure) {
            for ((row, col), &value) in chip.science.indexed_iter() {
                if !value.is_finite() || !is_good(&chip, row, col, bad_mask) {
                    continue;
                }
                let y = (row + chip.row_offset) as f64;
                if let Some(pixel) = map_pixel(solution, grid, col as f64, y) {
                    sum[pixel] += value - sky;
                    count[pixel] += 1.0;
                }
            }
        }

        let values = Zip::from(&sum)
            .and(&count)
            .map_collect(|&s, &c| if c > 0.0 { s / c } else { f32::NAN });
        let weight = if exposure.exposure_time > 0.0 {
            exposure.exposure_time as f32
        } else {
            1.0
        };
        Layer { values, weight }
    }

    /// Output-pixel rejection mask of every layer
    fn reject(layers: &[Layer], options: &CombineOptions) -> Vec<Array2<bool>> {
        let shape = layers[0].values.dim();
        let reference = Array2::from_shape_fn(shape, |pixel| {
            let mut stack: Vec<f32> = layers
                .iter()
                .map(|l| l.values[pixel])
                .filter(|v| v.is_finite())
                .collect();
            median(&mut stack).unwrap_or(f32::NAN)
        });

        let snr = options.cr_snr;
        let floor = options.cr_noise_floor * options.cr_noise_floor;
        layers
            .iter()
            .map(|layer| {
                Zip::from(&layer.values).and(&reference).map_collect(|&v, &m| {
                    v.is_finite() && m.is_finite() && v - m > snr * (m.max(0.0) + floor).sqrt()
                })
            })
            .collect()
    }

    /// Carry an output-pixel mask back to each chip of the exposure
    fn back_project(
        exposure: &Exposure,
        solution: &AstrometricSolution,
        grid: &GridGeometry,
        rejected: &Array2<bool>,
        bad_mask: u16,
    ) -> (ChipMasks, usize) {
        let mut masks = ChipMasks::new();
        let mut total = 0;
        for chip in chips(exposure) {
            let mut mask = Array2::from_elem(chip.science.dim(), false);
            for ((row, col), hit) in mask.indexed_iter_mut() {
                if !chip.science[[row, col]].is_finite() || !is_good(&chip, row, col, bad_mask) {
                    continue;
                }
                let y = (row + chip.row_offset) as f64;
                if let Some(pixel) = map_pixel(solution, grid, col as f64, y) {
                    if rejected[pixel] {
                        *hit = true;
                        total += 1;
                    }
                }
            }
            masks.insert(chip.version, mask);
        }
        (masks, total)
    }
}

impl DrizzleCombiner for PointKernelCombiner {
    fn combine(&self, request: &CombineRequest<'_>) -> MosaicResult<CombinedProduct> {
        let options = request.options;
        log::info!(
            "🧩 Combining {} exposure(s) into {} (rejection: {}, sky: {})",
            request.exposures.len(),
            request.label,
            options.rejection,
            options.sky_method
        );

        if request.exposures.is_empty() {
            return Err(MosaicError::Combination(format!("{}: no input exposures", request.label)));
        }
        let solutions: Vec<&AstrometricSolution> = request
            .exposures
            .iter()
            .map(|e| {
                e.solution.as_ref().ok_or_else(|| {
                    MosaicError::Combination(format!("{}: {} is not aligned", request.label, e.id))
                })
            })
            .collect::<MosaicResult<_>>()?;
        for exposure in request.exposures {
            check_planes(exposure)?;
        }

        let grid = match request.geometry {
            OutputGeometry::Locked(frame) => frame.grid().clone(),
            OutputGeometry::Neutral { pixel_scale } => neutral_grid(request.exposures, *pixel_scale)?,
        };

        let bad_mask = !bit_mask::<u16>(options.good_bits);
        let skies = Self::sky_offsets(request.exposures, options.sky_method, bad_mask);

        let inputs: Vec<(&Exposure, &AstrometricSolution, f32)> = request
            .exposures
            .iter()
            .copied()
            .zip(solutions.iter().copied())
            .zip(skies.iter().copied())
            .map(|((e, s), sky)| (e, s, sky))
            .collect();

        #[cfg(feature = "parallel")]
        let layers: Vec<Layer> = {
            use rayon::prelude::*;
            inputs
                .par_iter()
                .map(|(e, s, sky)| Self::resample(e, s, &grid, bad_mask, *sky))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let layers: Vec<Layer> = inputs
            .iter()
            .map(|(e, s, sky)| Self::resample(e, s, &grid, bad_mask, *sky))
            .collect();

        let mut rejection = RejectionSummary {
            enabled: options.rejection,
            ..Default::default()
        };
        let rejected = if options.rejection && layers.len() >= 2 {
            Self::reject(&layers, options)
        } else {
            if options.rejection {
                log::debug!("{}: single input, nothing to reject against", request.label);
            }
            layers
                .iter()
                .map(|l| Array2::from_elem(l.values.dim(), false))
                .collect()
        };

        let mut data = Array2::<f32>::zeros(grid.shape);
        let mut weight = Array2::<f32>::zeros(grid.shape);
        for (layer, mask) in layers.iter().zip(&rejected) {
            Zip::from(&mut data)
                .and(&mut weight)
                .and(&layer.values)
                .and(mask)
                .for_each(|d, w, &v, &hit| {
                    if v.is_finite() && !hit {
                        *d += layer.weight * v;
                        *w += layer.weight;
                    }
                });
        }
        let fill = options.fill_value.unwrap_or(f32::NAN);
        Zip::from(&mut data).and(&weight).for_each(|d, &w| {
            *d = if w > 0.0 { *d / w } else { fill };
        });

        if options.rejection && layers.len() >= 2 {
            for ((exposure, solution, _), mask) in inputs.iter().zip(&rejected) {
                let (masks, count) = Self::back_project(exposure, solution, &grid, mask, bad_mask);
                log::debug!("{}: rejected {} pixels of {}", request.label, count, exposure.id);
                rejection.rejected_pixels.insert(exposure.id.clone(), count);
                rejection.masks.insert(exposure.id.clone(), masks);
            }
        }

        let covered = weight.iter().filter(|&&w| w > 0.0).count();
        log::info!(
            "✅ {}: {}x{} grid, {:.1}% covered, {} pixels rejected",
            request.label,
            grid.shape.0,
            grid.shape.1,
            100.0 * covered as f64 / (grid.shape.0 * grid.shape.1) as f64,
            rejection.total_rejected()
        );

        Ok(CombinedProduct {
            label: request.label.to_string(),
            kind: request.kind,
            filename: request.filename.to_string(),
            members: request.exposures.iter().map(|e| e.id.clone()).collect(),
            grid,
            data,
            weight,
            rejection,
            mask_sequences: request
                .exposures
                .iter()
                .map(|e| (e.id.clone(), e.mask_sequence()))
                .collect::<BTreeMap<_, _>>(),
            created: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Extension;
    use approx::assert_relative_eq;

    fn options() -> CombineOptions {
        CombineOptions {
            rejection: false,
            sky_method: SkyMethod::None,
            fill_value: Some(0.0),
            good_bits: QualityBitSet::EMPTY,
            cr_snr: 3.5,
            cr_noise_floor: 1.0,
        }
    }

    fn exposure(id: &str, science: SciencePlane, dq: QualityPlane) -> Exposure {
        let mut e = Exposure::new(id, "ACS", "WFC", &["F606W"]);
        e.exposure_time = 100.0;
        e.solution = Some(AstrometricSolution {
            name: "FIT".to_string(),
            crval: (150.0, 2.0),
            crpix: (1.5, 1.5),
            pixel_scale: 0.05,
            rotation: 0.0,
        });
        e.extensions.push(Extension::science(1, science));
        e.extensions.push(Extension::quality(1, dq));
        e
    }

    #[test]
    fn test_neutral_grid_covers_input() {
        let e = exposure("a", Array2::from_elem((4, 4), 1.0), Array2::zeros((4, 4)));
        let grid = neutral_grid(&[&e], 0.05).unwrap();
        assert_eq!(grid.shape, (4, 4));
        assert_eq!(grid.solution.rotation, 0.0);
        assert_relative_eq!(grid.solution.crpix.0, 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_rejection_flags_outlier() {
        let clean = Array2::from_elem((4, 4), 10.0f32);
        let mut hit = clean.clone();
        hit[[2, 1]] = 500.0;
        let a = exposure("a", clean.clone(), Array2::zeros((4, 4)));
        let b = exposure("b", clean, Array2::zeros((4, 4)));
        let c = exposure("c", hit, Array2::zeros((4, 4)));

        let opts = CombineOptions { rejection: true, ..options() };
        let geometry = OutputGeometry::Neutral { pixel_scale: 0.05 };
        let product = PointKernelCombiner::new()
            .combine(&CombineRequest {
                label: "total",
                kind: ProductKind::Total,
                filename: "total.fits",
                exposures: &[&a, &b, &c],
                geometry: &geometry,
                options: &opts,
            })
            .unwrap();

        assert_eq!(product.rejection.rejected_pixels["c"], 1);
        assert_eq!(product.rejection.rejected_pixels["a"], 0);
        assert!(product.rejection.masks["c"][&1][[2, 1]]);
        assert_relative_eq!(product.data[[2, 1]], 10.0, epsilon = 1e-4);
    }

    #[test]
    fn test_bad_pixels_excluded_and_filled() {
        let mut dq = Array2::zeros((4, 4));
        dq[[0, 0]] = 4096u16;
        let a = exposure("a", Array2::from_elem((4, 4), 3.0), dq);
        let geometry = OutputGeometry::Neutral { pixel_scale: 0.05 };
        let opts = CombineOptions { fill_value: Some(-1.0), ..options() };
        let product = PointKernelCombiner::new()
            .combine(&CombineRequest {
                label: "single-a",
                kind: ProductKind::SingleExposure,
                filename: "a.fits",
                exposures: &[&a],
                geometry: &geometry,
                options: &opts,
            })
            .unwrap();
        assert_eq!(product.data[[0, 0]], -1.0);
        assert_eq!(product.weight[[0, 0]], 0.0);
        assert_relative_eq!(product.data[[1, 1]], 3.0);
    }

    #[test]
    fn test_neutral_grid_across_ra_zero() {
        let mut east = exposure("east", Array2::from_elem((4, 4), 1.0), Array2::zeros((4, 4)));
        let mut west = exposure("west", Array2::from_elem((4, 4), 1.0), Array2::zeros((4, 4)));
        east.solution.as_mut().unwrap().crval = (359.99999, 2.0);
        west.solution.as_mut().unwrap().crval = (0.00001, 2.0);

        let grid = neutral_grid(&[&east, &west], 0.05).unwrap();
        // 0.00002 deg apart is about 1.4 pixels, not a sweep round the sky
        assert!(grid.shape.1 < 10, "grid spans {:?}", grid.shape);
        assert_eq!(grid.shape.0, 4);
        let ra = grid.solution.crval.0;
        assert!(ra < 1e-4 || ra > 360.0 - 1e-4, "crval ra {}", ra);
        assert!((0.0..360.0).contains(&ra));

        let (x, _) = grid.solution.sky_to_pixel(0.00001, 2.0);
        let (x_east, _) = grid.solution.sky_to_pixel(359.99999, 2.0);
        assert_relative_eq!(x - x_east, 0.00002 * 3600.0 * 2.0f64.to_radians().cos() / 0.05, epsilon = 1e-3);
    }

    #[test]
    fn test_quality_shape_mismatch_is_error() {
        let a = exposure("a", Array2::from_elem((4, 4), 1.0), Array2::zeros((2, 2)));
        let geometry = OutputGeometry::Neutral { pixel_scale: 0.05 };
        let result = PointKernelCombiner::new().combine(&CombineRequest {
            label: "single-a",
            kind: ProductKind::SingleExposure,
            filename: "a.fits",
            exposures: &[&a],
            geometry: &geometry,
            options: &options(),
        });
        match result {
            Err(MosaicError::Combination(message)) => assert!(message.contains("DQ plane")),
            other => panic!("expected a combination error, got {:?}", other.map(|p| p.label)),
        }
    }
}
