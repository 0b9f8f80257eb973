use crate::core::classify::{parse_rootname, ExposureMeta, ObsetInput, VisitInfo};
use crate::io::exposure_file::ExposureFile;
use crate::types::{MosaicError, MosaicResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One line of the obset listing
#[derive(Debug, Deserialize)]
struct PollerRecord {
    filename: String,
    proposal_id: String,
    #[allow(dead_code)]
    program_id: String,
    obset_id: String,
    exptime: f64,
    filters: String,
    detector: String,
    #[serde(default)]
    path: Option<String>,
}

/// Read an obset listing into classifier input.
///
/// Each line is `filename,proposal_id,program_id,obset_id,exptime,filters,detector[,path]`
/// with filters separated by `;` or `-`. Every line must belong to the same
/// proposal and obset.
pub fn read_poller_file<P: AsRef<Path>>(path: P) -> MosaicResult<ObsetInput> {
    let path = path.as_ref();
    log::info!("Reading obset listing: {}", path.display());
    let contents = std::fs::read_to_string(path)?;
    parse_poller(&contents)
}

pub fn parse_poller(contents: &str) -> MosaicResult<ObsetInput> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(contents.as_bytes());

    let mut visit: Option<VisitInfo> = None;
    let mut exposures = BTreeMap::new();

    for (line, result) in reader.deserialize::<PollerRecord>().enumerate() {
        let record = result.map_err(|e| {
            MosaicError::InvalidFormat(format!("Obset listing line {}: {}", line + 1, e))
        })?;

        let id = record
            .filename
            .split(['_', '.'])
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let rootname = parse_rootname(&id)?;

        let this_visit = VisitInfo {
            proposal_id: record.proposal_id.clone(),
            obset_id: record.obset_id.to_lowercase(),
            instrument: rootname.instrument.to_string(),
            detector: record.detector.to_uppercase(),
        };
        match &visit {
            None => visit = Some(this_visit),
            Some(v) if v.proposal_id != this_visit.proposal_id || v.obset_id != this_visit.obset_id => {
                return Err(MosaicError::InvalidFormat(format!(
                    "{} belongs to {}/{}, listing is for {}/{}",
                    record.filename, this_visit.proposal_id, this_visit.obset_id, v.proposal_id, v.obset_id
                )));
            }
            Some(_) => {}
        }

        let meta = ExposureMeta {
            instrument: rootname.instrument.to_string(),
            detector: record.detector.to_uppercase(),
            filters: record
                .filters
                .split([';', '-'])
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
            exposure_time: record.exptime,
            // The listing names the raw file; the container sits beside it
            path: record.path.map(|dir| PathBuf::from(dir).join(ExposureFile::file_name(&id))),
        };

        if exposures.insert(id.clone(), meta).is_some() {
            return Err(MosaicError::InvalidFormat(format!(
                "Exposure {} listed more than once",
                id
            )));
        }
    }

    let visit = visit.ok_or_else(|| MosaicError::InvalidFormat("Empty obset listing".to_string()))?;
    log::info!(
        "Obset {}/{}: {} exposures",
        visit.proposal_id,
        visit.obset_id,
        exposures.len()
    );
    Ok(ObsetInput { visit, exposures })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        let listing = "\
# poller output
j9es06rbq_flc.fits,10265,9ES,06,500.0,F606W;CLEAR2L,WFC
j9es06rcq_flc.fits,10265,9ES,06,500.0,F606W;CLEAR2L,WFC,/data/visit
j9es06req_flc.fits,10265,9ES,06,340.0,CLEAR1L-F814W,WFC
";
        let input = parse_poller(listing).unwrap();
        assert_eq!(input.visit.proposal_id, "10265");
        assert_eq!(input.visit.obset_id, "06");
        assert_eq!(input.visit.instrument, "ACS");
        assert_eq!(input.exposures.len(), 3);
        assert_eq!(input.exposures["j9es06req"].filters, vec!["CLEAR1L", "F814W"]);
        assert_eq!(
            input.exposures["j9es06rcq"].path.as_deref(),
            Some(Path::new("/data/visit/j9es06rcq_flc.xml"))
        );
        assert!(input.exposures["j9es06rbq"].path.is_none());
    }

    #[test]
    fn test_mixed_obsets_rejected() {
        let listing = "\
j9es06rbq_flc.fits,10265,9ES,06,500.0,F606W,WFC
j9es07rcq_flc.fits,10265,9ES,07,500.0,F606W,WFC
";
        assert!(matches!(parse_poller(listing), Err(MosaicError::InvalidFormat(_))));
    }

    #[test]
    fn test_empty_listing_rejected() {
        assert!(parse_poller("# nothing\n").is_err());
    }
}
