use crate::types::{MosaicError, MosaicResult, ObsetGroup, ProductKind};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Visit-level identity shared by every product name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitInfo {
    pub proposal_id: String,
    pub obset_id: String,
    pub instrument: String,
    pub detector: String,
}

/// Per-exposure metadata needed for classification
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureMeta {
    pub instrument: String,
    pub detector: String,
    pub filters: Vec<String>,
    pub exposure_time: f64,
    /// Location of the exposure file, when known
    pub path: Option<PathBuf>,
}

impl ExposureMeta {
    pub fn filter_tag(&self) -> String {
        filter_tag(&self.filters)
    }
}

/// Classifier input: exposure id → metadata for one visit
#[derive(Debug, Clone)]
pub struct ObsetInput {
    pub visit: VisitInfo,
    pub exposures: BTreeMap<String, ExposureMeta>,
}

/// Decoded `ipppssoot` exposure rootname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rootname {
    pub instrument: &'static str,
    pub program: String,
    pub obset: String,
    pub observation: String,
}

static ROOTNAME: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn rootname_pattern() -> MosaicResult<&'static Regex> {
    ROOTNAME
        .get_or_init(|| Regex::new(r"^([a-z])([a-z0-9]{3})([a-z0-9]{2})([a-z0-9]{2})[a-z0-9]$"))
        .as_ref()
        .map_err(|e| MosaicError::Processing(format!("Regex error: {}", e)))
}

pub fn parse_rootname(id: &str) -> MosaicResult<Rootname> {
    let pattern = rootname_pattern()?;
    let lower = id.to_lowercase();
    let captures = pattern
        .captures(&lower)
        .ok_or_else(|| MosaicError::InvalidFormat(format!("'{}' is not an ipppssoot rootname", id)))?;

    let instrument = match &captures[1] {
        "j" => "ACS",
        "i" => "WFC3",
        "o" => "STIS",
        "l" => "COS",
        "u" => "WFPC2",
        "n" => "NICMOS",
        other => {
            return Err(MosaicError::InvalidFormat(format!(
                "Unknown instrument code '{}' in {}",
                other, id
            )))
        }
    };

    Ok(Rootname {
        instrument,
        program: captures[2].to_string(),
        obset: captures[3].to_string(),
        observation: captures[4].to_string(),
    })
}

/// Lower-case filter tag: non-clear filter names joined with `-`.
///
/// An exposure whose wheels are all clear is tagged `clear`.
pub fn filter_tag<S: AsRef<str>>(filters: &[S]) -> String {
    let names: Vec<String> = filters
        .iter()
        .map(|f| f.as_ref().trim().to_lowercase())
        .filter(|f| !f.is_empty() && !f.starts_with("clear") && f != "n/a")
        .collect();

    if names.is_empty() {
        "clear".to_string()
    } else {
        names.join("-")
    }
}

/// Canonical product naming
#[derive(Debug, Clone)]
pub struct NamingConvention {
    pub suffix: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self { suffix: "drc".to_string() }
    }
}

impl NamingConvention {
    pub fn new(suffix: &str) -> Self {
        Self { suffix: suffix.to_lowercase() }
    }

    fn prefix(&self, visit: &VisitInfo) -> String {
        format!(
            "hst_{}_{}_{}_{}",
            visit.proposal_id, visit.obset_id, visit.instrument, visit.detector
        )
        .to_lowercase()
    }

    pub fn total_filename(&self, visit: &VisitInfo) -> String {
        format!("{}_total_{}.fits", self.prefix(visit), self.suffix)
    }

    pub fn filter_filename(&self, visit: &VisitInfo, tag: &str) -> String {
        format!("{}_{}_{}.fits", self.prefix(visit), tag.to_lowercase(), self.suffix)
    }

    /// Single-exposure name uses the first 8 characters of the exposure id
    pub fn single_filename(&self, visit: &VisitInfo, tag: &str, exposure_id: &str) -> String {
        let short: String = exposure_id.chars().take(8).collect();
        format!(
            "{}_{}_{}_{}.fits",
            self.prefix(visit),
            tag.to_lowercase(),
            short.to_lowercase(),
            self.suffix
        )
    }
}

pub fn total_label() -> String {
    "total".to_string()
}

pub fn filter_label(tag: &str) -> String {
    format!("filter-{}", tag.to_lowercase())
}

pub fn single_label(exposure_id: &str) -> String {
    format!("single-{}", exposure_id.to_lowercase())
}

/// Product groups of one visit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedObset {
    pub visit: VisitInfo,
    groups: Vec<ObsetGroup>,
    total_index: usize,
}

impl ClassifiedObset {
    /// Validate a set of groups.
    ///
    /// Exactly one non-single group label may contain `total` (exposure ids
    /// can spell it, so single-exposure labels are not counted), filenames
    /// must be unique,
    /// and every exposure of the total group must sit in exactly one filter
    /// group and exactly one single-exposure group.
    pub fn from_groups(visit: VisitInfo, groups: Vec<ObsetGroup>) -> MosaicResult<Self> {
        let totals: Vec<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, g)| {
                g.kind != ProductKind::SingleExposure && g.label.to_lowercase().contains("total")
            })
            .map(|(i, _)| i)
            .collect();
        if totals.len() != 1 {
            return Err(MosaicError::NoTotalProduct { found: totals.len() });
        }
        let total_index = totals[0];

        let mut owners: HashMap<&str, &str> = HashMap::new();
        for group in &groups {
            if let Some(first) = owners.insert(&group.filename, &group.label) {
                return Err(MosaicError::NamingCollision {
                    filename: group.filename.clone(),
                    first: first.to_string(),
                    second: group.label.clone(),
                });
            }
        }

        for member in &groups[total_index].members {
            for kind in [ProductKind::Filter, ProductKind::SingleExposure] {
                let count = groups
                    .iter()
                    .filter(|g| g.kind == kind && g.members.contains(member))
                    .count();
                if count != 1 {
                    return Err(MosaicError::Processing(format!(
                        "Exposure {} belongs to {} {} groups, expected exactly one",
                        member, count, kind
                    )));
                }
            }
        }

        Ok(Self { visit, groups, total_index })
    }

    pub fn total(&self) -> &ObsetGroup {
        &self.groups[self.total_index]
    }

    pub fn groups(&self) -> &[ObsetGroup] {
        &self.groups
    }

    pub fn filter_groups(&self) -> impl Iterator<Item = &ObsetGroup> {
        self.groups.iter().filter(|g| g.kind == ProductKind::Filter)
    }

    pub fn single_groups(&self) -> impl Iterator<Item = &ObsetGroup> {
        self.groups.iter().filter(|g| g.kind == ProductKind::SingleExposure)
    }

    pub fn group(&self, label: &str) -> Option<&ObsetGroup> {
        self.groups.iter().find(|g| g.label == label)
    }

    /// Single-exposure group holding `exposure_id`
    pub fn single_for(&self, exposure_id: &str) -> Option<&ObsetGroup> {
        self.single_groups()
            .find(|g| g.members.iter().any(|m| m == exposure_id))
    }
}

/// Group a visit's exposures into total, filter and single-exposure products
pub fn classify(input: &ObsetInput, naming: &NamingConvention) -> MosaicResult<ClassifiedObset> {
    log::info!(
        "🗂️  Classifying {} exposures of obset {}/{}",
        input.exposures.len(),
        input.visit.proposal_id,
        input.visit.obset_id
    );

    if input.exposures.is_empty() {
        return Err(MosaicError::NoTotalProduct { found: 0 });
    }

    let visit = &input.visit;
    let mut groups = Vec::with_capacity(2 * input.exposures.len() + 1);

    groups.push(ObsetGroup {
        label: total_label(),
        kind: ProductKind::Total,
        filter_tag: None,
        members: input.exposures.keys().cloned().collect(),
        filename: naming.total_filename(visit),
    });

    let mut by_filter: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, meta) in &input.exposures {
        by_filter.entry(meta.filter_tag()).or_default().push(id.clone());
    }
    for (tag, members) in by_filter {
        log::debug!("Filter {}: {:?}", tag, members);
        groups.push(ObsetGroup {
            label: filter_label(&tag),
            kind: ProductKind::Filter,
            filename: naming.filter_filename(visit, &tag),
            filter_tag: Some(tag),
            members,
        });
    }

    for (id, meta) in &input.exposures {
        let tag = meta.filter_tag();
        groups.push(ObsetGroup {
            label: single_label(id),
            kind: ProductKind::SingleExposure,
            filename: naming.single_filename(visit, &tag, id),
            filter_tag: Some(tag),
            members: vec![id.clone()],
        });
    }

    ClassifiedObset::from_groups(visit.clone(), groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit() -> VisitInfo {
        VisitInfo {
            proposal_id: "10265".to_string(),
            obset_id: "06".to_string(),
            instrument: "ACS".to_string(),
            detector: "WFC".to_string(),
        }
    }

    #[test]
    fn test_rootname() {
        let root = parse_rootname("j9es06rbq").unwrap();
        assert_eq!(root.instrument, "ACS");
        assert_eq!(root.program, "9es");
        assert_eq!(root.obset, "06");
        assert_eq!(root.observation, "rb");
        assert!(parse_rootname("x9es06rbq").is_err());
        assert!(parse_rootname("j9es06").is_err());
    }

    #[test]
    fn test_rootname_pattern_compiled_once() {
        let first = rootname_pattern().unwrap();
        for id in ["j9es06rbq", "j9es06rcq", "ib2j01abq"] {
            parse_rootname(id).unwrap();
        }
        assert!(std::ptr::eq(first, rootname_pattern().unwrap()));
    }

    #[test]
    fn test_filter_tag() {
        assert_eq!(filter_tag(&["F606W", "CLEAR2L"]), "f606w");
        assert_eq!(filter_tag(&["CLEAR1L", "F814W"]), "f814w");
        assert_eq!(filter_tag(&["F658N", "POL0V"]), "f658n-pol0v");
        assert_eq!(filter_tag(&["CLEAR1L", "CLEAR2L"]), "clear");
        assert_eq!(filter_tag::<&str>(&[]), "clear");
    }

    #[test]
    fn test_filenames() {
        let naming = NamingConvention::default();
        assert_eq!(naming.total_filename(&visit()), "hst_10265_06_acs_wfc_total_drc.fits");
        assert_eq!(
            naming.filter_filename(&visit(), "F606W"),
            "hst_10265_06_acs_wfc_f606w_drc.fits"
        );
        assert_eq!(
            naming.single_filename(&visit(), "f606w", "J9ES06RBQ"),
            "hst_10265_06_acs_wfc_f606w_j9es06rb_drc.fits"
        );
    }
}
