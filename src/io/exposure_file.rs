//! XML exposure container.
//!
//! One file holds the exposure header (identity, filters, header WCS, mask
//! provenance) and its extensions, each extension carrying its pixels as
//! whitespace-separated row-major values:
//!
//! ```xml
//! <exposure id="j9es06rbq" instrument="ACS" detector="WFC" filters="F606W;CLEAR2L" exptime="500">
//!   <wcs name="OPUS" crval1="150.1" crval2="2.2" crpix1="2" crpix2="2" scale="0.05" orientat="0"/>
//!   <ext extname="SCI" extver="1" rows="2" cols="2" dtype="float32">1 2 3 4</ext>
//!   <ext extname="DQ" extver="1" rows="2" cols="2" dtype="uint16">0 4096 2 4098</ext>
//! </exposure>
//! ```

use crate::types::{
    AstrometricSolution, CombinedProduct, Exposure, Extension, GridGeometry, MaskOperation,
    MaskProvenance, MosaicError, MosaicResult, PlaneData, ProductKind, QualityBitSet,
    RejectionSummary,
};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "exposure")]
struct ExposureRecord {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@instrument")]
    instrument: String,
    #[serde(rename = "@detector")]
    detector: String,
    #[serde(rename = "@filters", default)]
    filters: String,
    #[serde(rename = "@exptime", default)]
    exptime: f64,
    #[serde(rename = "wcs", default, skip_serializing_if = "Option::is_none")]
    wcs: Option<WcsRecord>,
    #[serde(rename = "provenance", default, skip_serializing_if = "Option::is_none")]
    provenance: Option<ProvenanceRecord>,
    #[serde(rename = "ext", default)]
    extensions: Vec<ExtensionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WcsRecord {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@crval1")]
    crval1: f64,
    #[serde(rename = "@crval2")]
    crval2: f64,
    #[serde(rename = "@crpix1")]
    crpix1: f64,
    #[serde(rename = "@crpix2")]
    crpix2: f64,
    #[serde(rename = "@scale")]
    scale: f64,
    #[serde(rename = "@orientat")]
    orientat: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProvenanceRecord {
    #[serde(rename = "@pass")]
    pass: String,
    #[serde(rename = "@operation")]
    operation: String,
    #[serde(rename = "@bits")]
    bits: u32,
    #[serde(rename = "@sequence")]
    sequence: u64,
    #[serde(rename = "@timestamp")]
    timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExtensionRecord {
    #[serde(rename = "@extname")]
    extname: String,
    #[serde(rename = "@extver", default = "default_extver")]
    extver: u32,
    #[serde(rename = "@rows")]
    rows: usize,
    #[serde(rename = "@cols")]
    cols: usize,
    #[serde(rename = "@dtype", default)]
    dtype: String,
    #[serde(rename = "$text", default)]
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "product")]
struct ProductRecord {
    #[serde(rename = "@label")]
    label: String,
    #[serde(rename = "@kind")]
    kind: String,
    #[serde(rename = "@filename")]
    filename: String,
    #[serde(rename = "@created")]
    created: String,
    #[serde(rename = "@rejection")]
    rejection: bool,
    #[serde(rename = "wcs")]
    wcs: WcsRecord,
    #[serde(rename = "input", default)]
    inputs: Vec<InputRecord>,
    #[serde(rename = "ext", default)]
    extensions: Vec<ExtensionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InputRecord {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@sequence")]
    sequence: u64,
    #[serde(rename = "@rejected")]
    rejected: usize,
}

fn default_extver() -> u32 {
    1
}

impl From<&AstrometricSolution> for WcsRecord {
    fn from(wcs: &AstrometricSolution) -> Self {
        Self {
            name: wcs.name.clone(),
            crval1: wcs.crval.0,
            crval2: wcs.crval.1,
            crpix1: wcs.crpix.0,
            crpix2: wcs.crpix.1,
            scale: wcs.pixel_scale,
            orientat: wcs.rotation,
        }
    }
}

impl From<WcsRecord> for AstrometricSolution {
    fn from(record: WcsRecord) -> Self {
        Self {
            name: record.name,
            crval: (record.crval1, record.crval2),
            crpix: (record.crpix1, record.crpix2),
            pixel_scale: record.scale,
            rotation: record.orientat,
        }
    }
}

impl ProvenanceRecord {
    fn from_provenance(provenance: &MaskProvenance) -> Self {
        Self {
            pass: provenance.pass.clone(),
            operation: match provenance.operation {
                MaskOperation::Cleared => "cleared".to_string(),
                MaskOperation::Flagged => "flagged".to_string(),
            },
            bits: provenance.bits.bits(),
            sequence: provenance.sequence,
            timestamp: provenance.timestamp.to_rfc3339(),
        }
    }

    fn into_provenance(self) -> MosaicResult<MaskProvenance> {
        let operation = match self.operation.to_lowercase().as_str() {
            "cleared" => MaskOperation::Cleared,
            "flagged" => MaskOperation::Flagged,
            other => {
                return Err(MosaicError::InvalidFormat(format!(
                    "Unknown mask operation: {}",
                    other
                )))
            }
        };
        Ok(MaskProvenance {
            pass: self.pass,
            operation,
            bits: QualityBitSet::new(self.bits),
            sequence: self.sequence,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}

impl ExtensionRecord {
    fn from_extension(ext: &Extension) -> Self {
        let (rows, cols) = ext.data.dim();
        let (dtype, data) = match &ext.data {
            PlaneData::Float(a) => ("float32", join_values(a)),
            PlaneData::Integer(a) => ("uint16", join_values(a)),
        };
        Self {
            extname: ext.name.clone(),
            extver: ext.version,
            rows,
            cols,
            dtype: dtype.to_string(),
            data,
        }
    }

    fn into_extension(self, owner: &str) -> MosaicResult<Extension> {
        let context = format!("{}[{},{}]", owner, self.extname, self.extver);
        let integer = match self.dtype.to_lowercase().as_str() {
            "uint16" => true,
            "float32" => false,
            "" => self.extname.eq_ignore_ascii_case("dq"),
            other => {
                return Err(MosaicError::InvalidFormat(format!(
                    "{}: unsupported dtype {}",
                    context, other
                )))
            }
        };
        let data = if integer {
            PlaneData::Integer(parse_values(&self.data, self.rows, self.cols, &context)?)
        } else {
            PlaneData::Float(parse_values(&self.data, self.rows, self.cols, &context)?)
        };
        Ok(Extension {
            name: self.extname,
            version: self.extver,
            data,
        })
    }
}

/// DQ and SCI of one chip must share a shape
fn check_plane_shapes(exposure: &Exposure) -> MosaicResult<()> {
    for version in exposure.chip_versions() {
        if let (Some(science), Some(quality)) = (exposure.science(version), exposure.quality(version)) {
            if science.dim() != quality.dim() {
                return Err(MosaicError::InvalidFormat(format!(
                    "{}: DQ,{} is {:?} but SCI,{} is {:?}",
                    exposure.id,
                    version,
                    quality.dim(),
                    version,
                    science.dim()
                )));
            }
        }
    }
    Ok(())
}

fn join_values<T: Display>(array: &Array2<T>) -> String {
    array
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_values<T: FromStr>(
    text: &str,
    rows: usize,
    cols: usize,
    context: &str,
) -> MosaicResult<Array2<T>> {
    let values = text
        .split_whitespace()
        .map(|token| {
            token.parse::<T>().map_err(|_| {
                MosaicError::InvalidFormat(format!("{}: bad pixel value '{}'", context, token))
            })
        })
        .collect::<MosaicResult<Vec<T>>>()?;

    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| MosaicError::InvalidFormat(format!("{}: {}", context, e)))
}

fn parse_timestamp(text: &str) -> MosaicResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MosaicError::InvalidFormat(format!("Bad timestamp '{}': {}", text, e)))
}

/// Reader / writer for exposure and product files
pub struct ExposureFile;

impl ExposureFile {
    /// Name of an exposure's container file in its directory
    pub fn file_name(id: &str) -> String {
        format!("{}_flc.xml", id)
    }

    pub fn from_xml(xml: &str) -> MosaicResult<Exposure> {
        let record: ExposureRecord =
            quick_xml::de::from_str(xml).map_err(|e| MosaicError::XmlParsing(e.to_string()))?;

        let extensions = record
            .extensions
            .into_iter()
            .map(|ext| ext.into_extension(&record.id))
            .collect::<MosaicResult<Vec<_>>>()?;

        let provenance = record.provenance.map(|p| p.into_provenance()).transpose()?;

        let exposure = Exposure {
            filters: record
                .filters
                .split(';')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
            id: record.id,
            instrument: record.instrument,
            detector: record.detector,
            exposure_time: record.exptime,
            header_wcs: record.wcs.map(AstrometricSolution::from),
            solution: None,
            extensions,
            provenance,
        };
        check_plane_shapes(&exposure)?;
        Ok(exposure)
    }

    pub fn to_xml(exposure: &Exposure) -> MosaicResult<String> {
        let record = ExposureRecord {
            id: exposure.id.clone(),
            instrument: exposure.instrument.clone(),
            detector: exposure.detector.clone(),
            filters: exposure.filters.join(";"),
            exptime: exposure.exposure_time,
            // An aligned solution replaces the header WCS on write
            wcs: exposure
                .solution
                .as_ref()
                .or(exposure.header_wcs.as_ref())
                .map(WcsRecord::from),
            provenance: exposure.provenance.as_ref().map(ProvenanceRecord::from_provenance),
            extensions: exposure.extensions.iter().map(ExtensionRecord::from_extension).collect(),
        };
        quick_xml::se::to_string(&record).map_err(|e| MosaicError::XmlParsing(e.to_string()))
    }

    /// Read an exposure file
    pub fn read<P: AsRef<Path>>(path: P) -> MosaicResult<Exposure> {
        let path = path.as_ref();
        log::debug!("Reading exposure file: {}", path.display());
        let xml = std::fs::read_to_string(path)?;
        Self::from_xml(&xml)
    }

    /// Write an exposure file, replacing any existing file atomically
    pub fn write<P: AsRef<Path>>(path: P, exposure: &Exposure) -> MosaicResult<()> {
        let xml = Self::to_xml(exposure)?;
        write_atomic(path.as_ref(), &xml)
    }

    /// Open an exposure file for in-place update.
    ///
    /// Changes made through [`UpdateHandle::exposure_mut`] are written back
    /// by [`UpdateHandle::close`], or when the handle is dropped on any
    /// other exit path.
    pub fn open_update<P: AsRef<Path>>(path: P) -> MosaicResult<UpdateHandle> {
        let path = path.as_ref().to_path_buf();
        let exposure = Self::read(&path)?;
        Ok(UpdateHandle {
            path,
            exposure,
            dirty: false,
        })
    }

    /// Write a combined product (`SCI` and `WHT` planes on its grid)
    pub fn write_product<P: AsRef<Path>>(path: P, product: &CombinedProduct) -> MosaicResult<()> {
        let record = ProductRecord {
            label: product.label.clone(),
            kind: product.kind.to_string(),
            filename: product.filename.clone(),
            created: product.created.to_rfc3339(),
            rejection: product.rejection.enabled,
            wcs: WcsRecord::from(&product.grid.solution),
            inputs: product
                .members
                .iter()
                .map(|id| InputRecord {
                    id: id.clone(),
                    sequence: product.mask_sequences.get(id).copied().unwrap_or(0),
                    rejected: product.rejection.rejected_pixels.get(id).copied().unwrap_or(0),
                })
                .collect(),
            extensions: vec![
                ExtensionRecord::from_extension(&Extension::science(1, product.data.clone())),
                ExtensionRecord::from_extension(&Extension {
                    name: "WHT".to_string(),
                    version: 1,
                    data: PlaneData::Float(product.weight.clone()),
                }),
            ],
        };
        let xml = quick_xml::se::to_string(&record).map_err(|e| MosaicError::XmlParsing(e.to_string()))?;
        log::info!("💾 Writing {} product: {}", product.kind, path.as_ref().display());
        write_atomic(path.as_ref(), &xml)
    }

    /// Read a product written by [`write_product`](Self::write_product).
    ///
    /// Rejection masks are not persisted; only per-input counts survive.
    pub fn read_product<P: AsRef<Path>>(path: P) -> MosaicResult<CombinedProduct> {
        let xml = std::fs::read_to_string(path.as_ref())?;
        let record: ProductRecord =
            quick_xml::de::from_str(&xml).map_err(|e| MosaicError::XmlParsing(e.to_string()))?;

        let kind = match record.kind.as_str() {
            "total" => ProductKind::Total,
            "filter" => ProductKind::Filter,
            "single" => ProductKind::SingleExposure,
            other => {
                return Err(MosaicError::InvalidFormat(format!("Unknown product kind: {}", other)))
            }
        };

        let mut planes: BTreeMap<String, Array2<f32>> = BTreeMap::new();
        for ext in record.extensions {
            let extension = ext.into_extension(&record.label)?;
            if let PlaneData::Float(data) = extension.data {
                planes.insert(extension.name.to_uppercase(), data);
            }
        }
        let data = planes
            .remove("SCI")
            .ok_or_else(|| MosaicError::InvalidFormat(format!("{}: no SCI plane", record.label)))?;
        let weight = planes
            .remove("WHT")
            .ok_or_else(|| MosaicError::InvalidFormat(format!("{}: no WHT plane", record.label)))?;

        let mut rejection = RejectionSummary {
            enabled: record.rejection,
            ..Default::default()
        };
        let mut mask_sequences = BTreeMap::new();
        let mut members = Vec::with_capacity(record.inputs.len());
        for input in record.inputs {
            rejection.rejected_pixels.insert(input.id.clone(), input.rejected);
            mask_sequences.insert(input.id.clone(), input.sequence);
            members.push(input.id);
        }

        Ok(CombinedProduct {
            label: record.label,
            kind,
            filename: record.filename,
            members,
            grid: GridGeometry {
                solution: record.wcs.into(),
                shape: data.dim(),
            },
            data,
            weight,
            rejection,
            mask_sequences,
            created: parse_timestamp(&record.created)?,
        })
    }
}

fn write_atomic(path: &Path, contents: &str) -> MosaicResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Exposure opened in update mode
pub struct UpdateHandle {
    path: PathBuf,
    exposure: Exposure,
    dirty: bool,
}

impl UpdateHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exposure(&self) -> &Exposure {
        &self.exposure
    }

    /// Mutable access; marks the handle for write-back
    pub fn exposure_mut(&mut self) -> &mut Exposure {
        self.dirty = true;
        &mut self.exposure
    }

    /// Flush pending changes and release the handle
    pub fn close(mut self) -> MosaicResult<()> {
        self.flush()
    }

    fn flush(&mut self) -> MosaicResult<()> {
        if self.dirty {
            ExposureFile::write(&self.path, &self.exposure)?;
            self.dirty = false;
            log::debug!("Flushed {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for UpdateHandle {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}
