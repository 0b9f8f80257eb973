use crate::types::{MosaicError, MosaicResult, QualityBitSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Sky background handling applied before co-adding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkyMethod {
    /// Leave the background in place
    #[serde(rename = "none")]
    None,
    /// Subtract the lowest sky level of all inputs from every input
    #[serde(rename = "globalmin")]
    GlobalMin,
    /// Equalise every input to the lowest sky level
    #[serde(rename = "match")]
    Match,
    /// Equalise, then remove the common level (each input's own sky)
    #[serde(rename = "match+globalmin")]
    MatchGlobalMin,
}

impl fmt::Display for SkyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkyMethod::None => write!(f, "none"),
            SkyMethod::GlobalMin => write!(f, "globalmin"),
            SkyMethod::Match => write!(f, "match"),
            SkyMethod::MatchGlobalMin => write!(f, "match+globalmin"),
        }
    }
}

impl FromStr for SkyMethod {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(SkyMethod::None),
            "globalmin" => Ok(SkyMethod::GlobalMin),
            "match" => Ok(SkyMethod::Match),
            "match+globalmin" | "globalmin+match" => Ok(SkyMethod::MatchGlobalMin),
            other => Err(MosaicError::Config(format!("Unknown sky method: {}", other))),
        }
    }
}

/// Parameters of the staged mosaic pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Detector-default output scale (arcsec/pixel) keyed by `INSTRUMENT/DETECTOR`
    pub detector_scales: BTreeMap<String, f64>,
    /// Scale used for detectors missing from `detector_scales`
    pub default_scale: f64,
    /// Cosmic-ray flag bits re-armed before the refined total pass
    pub cr_bits: QualityBitSet,
    /// DQ bits still considered good data when combining
    pub good_bits: QualityBitSet,
    /// Rejection threshold in units of the expected noise
    pub cr_snr: f32,
    /// Noise floor added in quadrature to the Poisson term
    pub cr_noise_floor: f32,
    pub sky_method: SkyMethod,
    pub filter_fill_value: f32,
    pub single_fill_value: f32,
    /// Suffix of output products (`drc` for CTE-corrected inputs)
    pub output_suffix: String,
    /// Run independent filter / exposure items on the rayon pool
    pub parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let detector_scales = [
            ("ACS/WFC", 0.05),
            ("ACS/HRC", 0.025),
            ("ACS/SBC", 0.025),
            ("WFC3/UVIS", 0.04),
            ("WFC3/IR", 0.128),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();

        Self {
            detector_scales,
            default_scale: 0.05,
            cr_bits: QualityBitSet::new(4096),
            good_bits: QualityBitSet::new(16 + 64 + 256),
            cr_snr: 3.5,
            cr_noise_floor: 1.0,
            sky_method: SkyMethod::MatchGlobalMin,
            filter_fill_value: 0.0,
            single_fill_value: 0.0,
            output_suffix: "drc".to_string(),
            parallel: true,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing keys keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> MosaicResult<Self> {
        let path = path.as_ref();
        log::info!("Reading pipeline configuration: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .map_err(|e| MosaicError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MosaicResult<()> {
        if self.cr_bits.is_empty() {
            return Err(MosaicError::Config("cr_bits must name at least one bit".to_string()));
        }
        // DQ planes are 16-bit; wider flags would be dropped silently
        for (name, bits) in [("cr_bits", self.cr_bits), ("good_bits", self.good_bits)] {
            if bits.bits() > u32::from(u16::MAX) {
                return Err(MosaicError::Config(format!(
                    "{} ({}) has flags above bit 15, quality planes are 16-bit",
                    name, bits
                )));
            }
        }
        if self.cr_bits.intersects(self.good_bits) {
            return Err(MosaicError::Config(format!(
                "good_bits ({}) overlap cr_bits ({})",
                self.good_bits, self.cr_bits
            )));
        }
        if !(self.default_scale > 0.0) {
            return Err(MosaicError::Config("default_scale must be positive".to_string()));
        }
        if let Some((key, scale)) = self.detector_scales.iter().find(|(_, s)| !(**s > 0.0)) {
            return Err(MosaicError::Config(format!(
                "scale for {} must be positive, got {}",
                key, scale
            )));
        }
        if !(self.cr_snr > 0.0) {
            return Err(MosaicError::Config("cr_snr must be positive".to_string()));
        }
        if self.output_suffix.is_empty() {
            return Err(MosaicError::Config("output_suffix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Detector-default pixel scale for `INSTRUMENT/DETECTOR`
    pub fn scale_for(&self, detector_key: &str) -> f64 {
        self.detector_scales
            .get(&detector_key.to_uppercase())
            .copied()
            .unwrap_or(self.default_scale)
    }
}

/// Switches handed through to member-product generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Produce the full mosaic hierarchy
    pub mosaic: bool,
    /// Produce sky-cell partitioned outputs
    pub cell: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self { mosaic: true, cell: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scale_for("acs/wfc"), 0.05);
        assert_eq!(config.scale_for("NICMOS/NIC1"), config.default_scale);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"cr_snr": 5.0, "sky_method": "globalmin"}"#).unwrap();
        assert_eq!(config.cr_snr, 5.0);
        assert_eq!(config.sky_method, SkyMethod::GlobalMin);
        assert_eq!(config.cr_bits, QualityBitSet::new(4096));
    }

    #[test]
    fn test_overlapping_bits_rejected() {
        let config = PipelineConfig {
            good_bits: QualityBitSet::new(4096 + 16),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(MosaicError::Config(_))));
    }

    #[test]
    fn test_flags_beyond_quality_width_rejected() {
        let config = PipelineConfig {
            cr_bits: QualityBitSet::new(65536),
            ..PipelineConfig::default()
        };
        match config.validate() {
            Err(MosaicError::Config(message)) => assert!(message.contains("cr_bits")),
            other => panic!("expected a config error, got {:?}", other),
        }

        let config: PipelineConfig = serde_json::from_str(r#"{"good_bits": 131072}"#).unwrap();
        assert!(matches!(config.validate(), Err(MosaicError::Config(_))));

        let config = PipelineConfig {
            cr_bits: QualityBitSet::new(32768),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sky_method_parsing() {
        assert_eq!("Match+GlobalMin".parse::<SkyMethod>().unwrap(), SkyMethod::MatchGlobalMin);
        assert!("median".parse::<SkyMethod>().is_err());
    }
}
