use crate::io::exposure_file::ExposureFile;
use crate::types::{
    Exposure, ExtensionVersion, MaskOperation, MosaicError, MosaicResult, PlaneData,
    QualityBitSet, RejectionSummary,
};
use ndarray::{Array2, Zip};
use num_traits::PrimInt;
use std::path::Path;

/// Default EXTNAME of quality planes
pub const DEFAULT_EXTNAME: &str = "dq";

/// Bits of `bits` representable in `T`, as a `T` mask
pub fn bit_mask<T: PrimInt>(bits: QualityBitSet) -> T {
    let width = (T::zero().count_zeros() as usize).min(32);
    (0..width)
        .filter(|shift| (bits.bits() >> shift) & 1 == 1)
        .fold(T::zero(), |mask, shift| mask | (T::one() << shift))
}

/// `plane = plane & !bits`, element-wise
pub fn clear_bits<T: PrimInt>(plane: &mut Array2<T>, bits: QualityBitSet) {
    let keep = !bit_mask::<T>(bits);
    plane.mapv_inplace(|value| value & keep);
}

/// Set `bits` wherever `mask` is true; returns the number of flagged pixels
pub fn set_bits<T: PrimInt>(
    plane: &mut Array2<T>,
    mask: &Array2<bool>,
    bits: QualityBitSet,
) -> MosaicResult<usize> {
    if plane.dim() != mask.dim() {
        return Err(MosaicError::Processing(format!(
            "Mask shape {:?} does not match quality plane {:?}",
            mask.dim(),
            plane.dim()
        )));
    }

    let flag = bit_mask::<T>(bits);
    let mut flagged = 0;
    Zip::from(plane).and(mask).for_each(|value, &hit| {
        if hit {
            *value = *value | flag;
            flagged += 1;
        }
    });
    Ok(flagged)
}

/// Bit-reset request: which bits, on which quality extensions.
///
/// Defaults to every `DQ` extension of each exposure.
#[derive(Debug, Clone)]
pub struct ResetBits {
    bits: QualityBitSet,
    extver: ExtensionVersion,
    extname: String,
    pass: String,
}

impl ResetBits {
    pub fn new(bits: QualityBitSet) -> Self {
        Self {
            bits,
            extver: ExtensionVersion::All,
            extname: DEFAULT_EXTNAME.to_string(),
            pass: "resetbits".to_string(),
        }
    }

    /// Build from a textual bit specification (`"4096"`, `"2,32,64,4096"`)
    pub fn parse(spec: &str) -> MosaicResult<Self> {
        Ok(Self::new(spec.parse()?))
    }

    pub fn with_extver(mut self, extver: ExtensionVersion) -> Self {
        self.extver = extver;
        self
    }

    pub fn with_extname(mut self, extname: &str) -> Self {
        self.extname = extname.to_string();
        self
    }

    /// Name recorded in the provenance tag of every edited exposure
    pub fn for_pass(mut self, pass: &str) -> Self {
        self.pass = pass.to_string();
        self
    }

    pub fn bits(&self) -> QualityBitSet {
        self.bits
    }

    /// Clear the bits on every exposure; returns the number of planes edited.
    ///
    /// All exposures are validated before any plane is touched, so a
    /// missing extension leaves the whole set unchanged.
    pub fn apply(&self, exposures: &mut [Exposure]) -> MosaicResult<usize> {
        for exposure in exposures.iter() {
            self.validate(exposure)?;
        }

        let mut planes = 0;
        for exposure in exposures.iter_mut() {
            planes += self.apply_one(exposure)?;
        }
        Ok(planes)
    }

    /// Same as [`apply`](Self::apply) on a subset of `exposures` selected by id
    pub fn apply_to_members(&self, exposures: &mut [Exposure], members: &[String]) -> MosaicResult<usize> {
        let selected = |exposure: &Exposure| members.iter().any(|id| *id == exposure.id);

        for exposure in exposures.iter().filter(|e| selected(e)) {
            self.validate(exposure)?;
        }

        let mut planes = 0;
        for exposure in exposures.iter_mut().filter(|e| selected(e)) {
            planes += self.apply_one(exposure)?;
        }
        Ok(planes)
    }

    /// Clear the bits in exposure files, updating them in place
    pub fn apply_to_files<P: AsRef<Path>>(&self, paths: &[P]) -> MosaicResult<usize> {
        let mut planes = 0;
        for path in paths {
            let mut handle = ExposureFile::open_update(path)?;
            self.validate(handle.exposure())?;
            planes += self.apply_one(handle.exposure_mut())?;
            handle.close()?;
        }
        Ok(planes)
    }

    fn validate(&self, exposure: &Exposure) -> MosaicResult<()> {
        if let ExtensionVersion::Version(extver) = self.extver {
            if exposure.extension(&self.extname, extver).is_none() {
                return Err(MosaicError::MissingExtension {
                    exposure: exposure.id.clone(),
                    extname: self.extname.clone(),
                    extver,
                });
            }
        }

        let float_plane = exposure
            .extensions
            .iter()
            .filter(|ext| ext.matches(&self.extname, self.extver))
            .find(|ext| matches!(ext.data, PlaneData::Float(_)));
        if let Some(ext) = float_plane {
            return Err(MosaicError::NotAnIntegerPlane {
                exposure: exposure.id.clone(),
                extname: ext.name.clone(),
                extver: ext.version,
            });
        }
        Ok(())
    }

    fn apply_one(&self, exposure: &mut Exposure) -> MosaicResult<usize> {
        let mut planes = 0;
        for ext in exposure
            .extensions
            .iter_mut()
            .filter(|ext| ext.matches(&self.extname, self.extver))
        {
            if let PlaneData::Integer(plane) = &mut ext.data {
                clear_bits(plane, self.bits);
                planes += 1;
                log::info!(
                    "Reset bit values of {} to a value of 0 in {}[{},{}]",
                    self.bits,
                    exposure.id,
                    ext.name,
                    ext.version
                );
            }
        }

        if planes == 0 {
            log::debug!(
                "No {} extension matching version {} in {}",
                self.extname,
                self.extver,
                exposure.id
            );
        } else {
            exposure.record_mask_edit(&self.pass, MaskOperation::Cleared, self.bits);
        }
        Ok(planes)
    }
}

/// Clear `bits` in the matching quality planes of every exposure
pub fn reset_bits(
    exposures: &mut [Exposure],
    bits: QualityBitSet,
    extver: ExtensionVersion,
    extname: &str,
) -> MosaicResult<usize> {
    ResetBits::new(bits)
        .with_extver(extver)
        .with_extname(extname)
        .apply(exposures)
}

/// Write rejection masks of a combination pass into the exposures' DQ planes.
///
/// Shapes are checked for every exposure before any plane is modified;
/// chips without a `DQ` plane are skipped.
pub fn flag_rejected(
    exposures: &mut [Exposure],
    rejection: &RejectionSummary,
    bits: QualityBitSet,
    pass: &str,
) -> MosaicResult<usize> {
    for exposure in exposures.iter() {
        let Some(chips) = rejection.masks.get(&exposure.id) else {
            continue;
        };
        for (extver, mask) in chips {
            // Chips without a quality plane have nowhere to record rejections
            let Some(plane) = exposure.quality(*extver) else {
                log::debug!("{} has no DQ,{}; rejection mask dropped", exposure.id, extver);
                continue;
            };
            if plane.dim() != mask.dim() {
                return Err(MosaicError::Processing(format!(
                    "Rejection mask for {}[dq,{}] has shape {:?}, plane is {:?}",
                    exposure.id,
                    extver,
                    mask.dim(),
                    plane.dim()
                )));
            }
        }
    }

    let mut flagged = 0;
    for exposure in exposures.iter_mut() {
        let Some(chips) = rejection.masks.get(&exposure.id) else {
            continue;
        };
        let mut touched = false;
        for ext in exposure.extensions.iter_mut() {
            if !ext.matches(DEFAULT_EXTNAME, ExtensionVersion::All) {
                continue;
            }
            if let (Some(mask), PlaneData::Integer(plane)) = (chips.get(&ext.version), &mut ext.data) {
                flagged += set_bits(plane, mask, bits)?;
                touched = true;
            }
        }
        if touched {
            exposure.record_mask_edit(pass, MaskOperation::Flagged, bits);
        }
    }

    log::debug!("Flagged {} rejected pixels with bits {}", flagged, bits);
    Ok(flagged)
}
