use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

/// Real-valued science / error / weight pixels
pub type SciencePlane = Array2<f32>;

/// Integer data-quality (DQ) pixels
pub type QualityPlane = Array2<u16>;

/// Per-chip boolean masks keyed by extension version
pub type ChipMasks = BTreeMap<u32, Array2<bool>>;

/// Set of data-quality flag bits.
///
/// The wrapped integer is always read as a union of power-of-two flags,
/// never as a magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityBitSet(u32);

impl QualityBitSet {
    pub const EMPTY: QualityBitSet = QualityBitSet(0);

    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: QualityBitSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: QualityBitSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Individual power-of-two flags in ascending order
    pub fn flags(self) -> Vec<u32> {
        (0..32)
            .map(|shift| 1u32 << shift)
            .filter(|flag| self.0 & flag != 0)
            .collect()
    }
}

impl From<u32> for QualityBitSet {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

impl BitOr for QualityBitSet {
    type Output = QualityBitSet;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for QualityBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QualityBitSet {
    type Err = MosaicError;

    /// Parse `"4096"`, `"4194"`, `"2,32,64,4096"` or `"2+32+64+4096"`.
    ///
    /// Every token must be a non-negative integer; the result is the union
    /// of all tokens.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = spec
            .split(|c: char| c == ',' || c == '+' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .collect();

        if tokens.is_empty() {
            return Err(MosaicError::InvalidBitSpec(format!(
                "empty bit specification '{}'",
                spec
            )));
        }

        tokens.iter().try_fold(QualityBitSet::EMPTY, |acc, token| {
            token
                .parse::<u32>()
                .map(|value| acc | QualityBitSet(value))
                .map_err(|_| {
                    MosaicError::InvalidBitSpec(format!(
                        "'{}' in '{}' is not a non-negative integer",
                        token, spec
                    ))
                })
        })
    }
}

/// Extension version selector: every matching extension or one version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtensionVersion {
    #[default]
    All,
    Version(u32),
}

impl ExtensionVersion {
    pub fn matches(self, version: u32) -> bool {
        match self {
            ExtensionVersion::All => true,
            ExtensionVersion::Version(v) => v == version,
        }
    }
}

impl From<Option<u32>> for ExtensionVersion {
    fn from(version: Option<u32>) -> Self {
        version.map_or(ExtensionVersion::All, ExtensionVersion::Version)
    }
}

impl fmt::Display for ExtensionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionVersion::All => write!(f, "*"),
            ExtensionVersion::Version(v) => write!(f, "{}", v),
        }
    }
}

/// Pixel payload of one extension
#[derive(Debug, Clone, PartialEq)]
pub enum PlaneData {
    Float(SciencePlane),
    Integer(QualityPlane),
}

impl PlaneData {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            PlaneData::Float(a) => a.dim(),
            PlaneData::Integer(a) => a.dim(),
        }
    }
}

/// One named, versioned pixel plane of an exposure (SCI, ERR, DQ, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub name: String,
    pub version: u32,
    pub data: PlaneData,
}

impl Extension {
    pub fn science(version: u32, data: SciencePlane) -> Self {
        Self { name: "SCI".to_string(), version, data: PlaneData::Float(data) }
    }

    pub fn error(version: u32, data: SciencePlane) -> Self {
        Self { name: "ERR".to_string(), version, data: PlaneData::Float(data) }
    }

    pub fn quality(version: u32, data: QualityPlane) -> Self {
        Self { name: "DQ".to_string(), version, data: PlaneData::Integer(data) }
    }

    /// Case-insensitive name match plus version selector
    pub fn matches(&self, name: &str, version: ExtensionVersion) -> bool {
        self.name.eq_ignore_ascii_case(name) && version.matches(self.version)
    }
}

/// Tangent-plane astrometric solution (WCS) of an image.
///
/// `crpix` is the 0-based (x, y) pixel of the reference point, `crval`
/// its (RA, Dec) in degrees. Rotation is in degrees, scale in
/// arcsec/pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstrometricSolution {
    pub name: String,
    pub crval: (f64, f64),
    pub crpix: (f64, f64),
    pub pixel_scale: f64,
    pub rotation: f64,
}

impl AstrometricSolution {
    pub fn is_valid(&self) -> bool {
        self.crval.0.is_finite()
            && self.crval.1.is_finite()
            && self.crval.1.abs() < 90.0
            && self.crpix.0.is_finite()
            && self.crpix.1.is_finite()
            && self.pixel_scale.is_finite()
            && self.pixel_scale > 0.0
            && self.rotation.is_finite()
    }

    /// Tangent-plane offset in arcsec of a pixel from `crval`
    fn pixel_to_plane(&self, x: f64, y: f64) -> (f64, f64) {
        let (sin_t, cos_t) = self.rotation.to_radians().sin_cos();
        let dx = x - self.crpix.0;
        let dy = y - self.crpix.1;
        (
            self.pixel_scale * (cos_t * dx - sin_t * dy),
            self.pixel_scale * (sin_t * dx + cos_t * dy),
        )
    }

    pub fn pixel_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let (xi, eta) = self.pixel_to_plane(x, y);
        let cos_dec = self.crval.1.to_radians().cos();
        (
            normalize_ra(self.crval.0 + xi / (3600.0 * cos_dec)),
            self.crval.1 + eta / 3600.0,
        )
    }

    pub fn sky_to_pixel(&self, ra: f64, dec: f64) -> (f64, f64) {
        let cos_dec = self.crval.1.to_radians().cos();
        let xi = wrap_degrees(ra - self.crval.0) * cos_dec * 3600.0;
        let eta = (dec - self.crval.1) * 3600.0;
        let (sin_t, cos_t) = self.rotation.to_radians().sin_cos();
        (
            self.crpix.0 + (cos_t * xi + sin_t * eta) / self.pixel_scale,
            self.crpix.1 + (-sin_t * xi + cos_t * eta) / self.pixel_scale,
        )
    }
}

/// Angle difference in degrees wrapped into [-180, 180)
pub fn wrap_degrees(delta: f64) -> f64 {
    (delta + 180.0).rem_euclid(360.0) - 180.0
}

/// Right ascension in [0, 360)
pub fn normalize_ra(ra: f64) -> f64 {
    let ra = ra.rem_euclid(360.0);
    // rem_euclid can round up to the modulus itself
    if ra >= 360.0 {
        0.0
    } else {
        ra
    }
}

/// Output pixel grid: WCS plus (rows, cols)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub solution: AstrometricSolution,
    pub shape: (usize, usize),
}

/// What last wrote an exposure's quality mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskOperation {
    Cleared,
    Flagged,
}

/// Provenance tag of an exposure's quality planes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskProvenance {
    pub pass: String,
    pub operation: MaskOperation,
    pub bits: QualityBitSet,
    /// Incremented on every mask edit of the exposure
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// One raw exposure frame.
///
/// Chips are the `SCI` extensions; chip `n` pairs with `ERR,n` and `DQ,n`
/// and chips stack along y in version order under the exposure WCS.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub id: String,
    pub instrument: String,
    pub detector: String,
    pub filters: Vec<String>,
    pub exposure_time: f64,
    /// WCS as delivered by calibration, before visit alignment
    pub header_wcs: Option<AstrometricSolution>,
    /// Visit-aligned WCS; `None` until aligned
    pub solution: Option<AstrometricSolution>,
    pub extensions: Vec<Extension>,
    pub provenance: Option<MaskProvenance>,
}

impl Exposure {
    pub fn new(id: &str, instrument: &str, detector: &str, filters: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            instrument: instrument.to_string(),
            detector: detector.to_string(),
            filters: filters.iter().map(|f| f.to_string()).collect(),
            exposure_time: 0.0,
            header_wcs: None,
            solution: None,
            extensions: Vec::new(),
            provenance: None,
        }
    }

    /// Filter tag used for grouping and naming
    pub fn filter_tag(&self) -> String {
        crate::core::classify::filter_tag(&self.filters)
    }

    /// `INSTRUMENT/DETECTOR` key used for detector defaults
    pub fn detector_key(&self) -> String {
        format!(
            "{}/{}",
            self.instrument.to_uppercase(),
            self.detector.to_uppercase()
        )
    }

    pub fn extension(&self, name: &str, version: u32) -> Option<&Extension> {
        self.extensions
            .iter()
            .find(|ext| ext.matches(name, ExtensionVersion::Version(version)))
    }

    /// Versions of all `SCI` extensions in ascending order
    pub fn chip_versions(&self) -> Vec<u32> {
        let mut versions: Vec<u32> = self
            .extensions
            .iter()
            .filter(|ext| ext.matches("sci", ExtensionVersion::All))
            .map(|ext| ext.version)
            .collect();
        versions.sort_unstable();
        versions.dedup();
        versions
    }

    pub fn science(&self, version: u32) -> Option<&SciencePlane> {
        match self.extension("sci", version).map(|ext| &ext.data) {
            Some(PlaneData::Float(data)) => Some(data),
            _ => None,
        }
    }

    pub fn quality(&self, version: u32) -> Option<&QualityPlane> {
        match self.extension("dq", version).map(|ext| &ext.data) {
            Some(PlaneData::Integer(data)) => Some(data),
            _ => None,
        }
    }

    pub fn mask_sequence(&self) -> u64 {
        self.provenance.as_ref().map_or(0, |p| p.sequence)
    }

    /// Stamp a mask edit made by `pass`
    pub fn record_mask_edit(&mut self, pass: &str, operation: MaskOperation, bits: QualityBitSet) {
        let sequence = self.mask_sequence() + 1;
        self.provenance = Some(MaskProvenance {
            pass: pass.to_string(),
            operation,
            bits,
            sequence,
            timestamp: Utc::now(),
        });
    }
}

/// Target product of an obset group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProductKind {
    Total,
    Filter,
    SingleExposure,
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductKind::Total => write!(f, "total"),
            ProductKind::Filter => write!(f, "filter"),
            ProductKind::SingleExposure => write!(f, "single"),
        }
    }
}

/// Named set of exposures combined into one product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObsetGroup {
    pub label: String,
    pub kind: ProductKind,
    pub filter_tag: Option<String>,
    pub members: Vec<String>,
    pub filename: String,
}

/// Pixels rejected by one combination pass
#[derive(Debug, Clone, Default)]
pub struct RejectionSummary {
    pub enabled: bool,
    pub rejected_pixels: BTreeMap<String, usize>,
    /// Input-pixel rejection masks per exposure and chip
    pub masks: BTreeMap<String, ChipMasks>,
}

impl RejectionSummary {
    pub fn total_rejected(&self) -> usize {
        self.rejected_pixels.values().sum()
    }
}

/// Output of one combination pass
#[derive(Debug, Clone)]
pub struct CombinedProduct {
    pub label: String,
    pub kind: ProductKind,
    pub filename: String,
    pub members: Vec<String>,
    pub grid: GridGeometry,
    pub data: SciencePlane,
    pub weight: SciencePlane,
    pub rejection: RejectionSummary,
    /// Mask provenance sequence of each input at combination time
    pub mask_sequences: BTreeMap<String, u64>,
    pub created: DateTime<Utc>,
}

/// Shared output grid of a visit.
///
/// Only obtainable from a combined product; no mutable access is exposed,
/// so a frame stays exactly as extracted for the rest of the visit.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceFrame {
    grid: GridGeometry,
}

impl ReferenceFrame {
    /// Freeze the grid of `product` as the visit frame
    pub fn from_product(product: &CombinedProduct) -> MosaicResult<Self> {
        let grid = &product.grid;
        if !grid.solution.is_valid() {
            return Err(MosaicError::FrameExtraction(format!(
                "{} has no valid astrometric solution: {:?}",
                product.label, grid.solution
            )));
        }
        if grid.shape.0 == 0 || grid.shape.1 == 0 {
            return Err(MosaicError::FrameExtraction(format!(
                "{} has an empty grid {:?}",
                product.label, grid.shape
            )));
        }
        if product.data.dim() != grid.shape {
            return Err(MosaicError::FrameExtraction(format!(
                "{} pixels {:?} disagree with its grid {:?}",
                product.label,
                product.data.dim(),
                grid.shape
            )));
        }
        Ok(Self { grid: grid.clone() })
    }

    pub fn grid(&self) -> &GridGeometry {
        &self.grid
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.grid.shape
    }

    pub fn pixel_scale(&self) -> f64 {
        self.grid.solution.pixel_scale
    }

    pub fn rotation(&self) -> f64 {
        self.grid.solution.rotation
    }

    pub fn origin(&self) -> (f64, f64) {
        self.grid.solution.crval
    }

    pub fn wcs_name(&self) -> &str {
        &self.grid.solution.name
    }

    /// True when `grid` is exactly this frame
    pub fn matches(&self, grid: &GridGeometry) -> bool {
        self.grid == *grid
    }
}

/// Error types for mosaic processing
#[derive(Debug, thiserror::Error)]
pub enum MosaicError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid bit specification: {0}")]
    InvalidBitSpec(String),

    #[error("Missing extension {extname},{extver} in {exposure}")]
    MissingExtension {
        exposure: String,
        extname: String,
        extver: u32,
    },

    #[error("Extension {extname},{extver} of {exposure} is not an integer plane")]
    NotAnIntegerPlane {
        exposure: String,
        extname: String,
        extver: u32,
    },

    #[error("Output filename {filename} derived for both {first} and {second}")]
    NamingCollision {
        filename: String,
        first: String,
        second: String,
    },

    #[error("Expected exactly one total product, found {found}")]
    NoTotalProduct { found: usize },

    #[error("Cannot extract reference frame: {0}")]
    FrameExtraction(String),

    #[error("Pipeline failed during {state}: {reason}")]
    TotalPipelineFailure { state: String, reason: String },

    #[error("Alignment failed for {exposure}: {reason}")]
    Alignment { exposure: String, reason: String },

    #[error("Combination error: {0}")]
    Combination(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for mosaic operations
pub type MosaicResult<T> = Result<T, MosaicError>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bit_spec_forms() {
        assert_eq!("4096".parse::<QualityBitSet>().unwrap().bits(), 4096);
        assert_eq!("4194".parse::<QualityBitSet>().unwrap().bits(), 4194);
        assert_eq!("2,32,64,4096".parse::<QualityBitSet>().unwrap().bits(), 4194);
        assert_eq!("2+32 + 64+4096".parse::<QualityBitSet>().unwrap().bits(), 4194);
        assert_eq!(
            "2,32,64,4096".parse::<QualityBitSet>().unwrap(),
            "2,32,64,4096".parse::<QualityBitSet>().unwrap()
        );
    }

    #[test]
    fn test_bit_spec_rejects_garbage() {
        for spec in ["", "  ", "dq", "4096,abc", "-2", "3.5"] {
            match spec.parse::<QualityBitSet>() {
                Err(MosaicError::InvalidBitSpec(_)) => {}
                other => panic!("expected InvalidBitSpec for '{}', got {:?}", spec, other),
            }
        }
    }

    #[test]
    fn test_flags() {
        assert_eq!(QualityBitSet::new(4098).flags(), vec![2, 4096]);
        assert!(QualityBitSet::new(4098).contains(QualityBitSet::new(2)));
        assert!(!QualityBitSet::new(4098).intersects(QualityBitSet::new(64)));
    }

    #[test]
    fn test_wcs_across_ra_zero() {
        let wcs = AstrometricSolution {
            name: "TEST".to_string(),
            crval: (359.9999, -30.0),
            crpix: (10.0, 10.0),
            pixel_scale: 0.1,
            rotation: 0.0,
        };
        let (ra, dec) = wcs.pixel_to_sky(20.0, 10.0);
        assert!(ra < 1.0, "ra {} not normalised", ra);
        let (x, y) = wcs.sky_to_pixel(ra, dec);
        assert_relative_eq!(x, 20.0, epsilon = 1e-6);
        assert_relative_eq!(y, 10.0, epsilon = 1e-6);
        assert_relative_eq!(wrap_degrees(0.5 - 359.5), 1.0, epsilon = 1e-9);
        assert_eq!(normalize_ra(-0.0), 0.0);
    }

    #[test]
    fn test_wcs_roundtrip() {
        let wcs = AstrometricSolution {
            name: "TEST".to_string(),
            crval: (150.1, 2.2),
            crpix: (50.0, 40.0),
            pixel_scale: 0.05,
            rotation: 33.0,
        };
        let (ra, dec) = wcs.pixel_to_sky(12.5, 77.25);
        let (x, y) = wcs.sky_to_pixel(ra, dec);
        assert_relative_eq!(x, 12.5, epsilon = 1e-6);
        assert_relative_eq!(y, 77.25, epsilon = 1e-6);
    }
}
