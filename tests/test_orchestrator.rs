use ndarray::Array2;
use std::io::Write;
use std::sync::Mutex;
use tempfile::{NamedTempFile, TempDir};
use visit_mosaic::core::align::{Aligner, AlignmentResults, HeaderWcsAligner};
use visit_mosaic::core::classify::{classify, NamingConvention};
use visit_mosaic::core::drizzle::PointKernelCombiner;
use visit_mosaic::core::orchestrator::{process_obset, CatalogGenerator, CatalogRequest, Collaborators};
use visit_mosaic::core::staged::{PipelineState, RunStatus};
use visit_mosaic::io::read_poller_file;
use visit_mosaic::types::Extension;
use visit_mosaic::{
    AstrometricSolution, Exposure, ExposureFile, MosaicError, MosaicResult, PipelineConfig,
    ProcessOptions, SkyMethod,
};

const LISTING: &str = "\
j9es06a1q_flc.fits,10265,9ES,06,100.0,F606W;CLEAR2L,WFC
j9es06b1q_flc.fits,10265,9ES,06,100.0,F606W;CLEAR2L,WFC
j9es06c1q_flc.fits,10265,9ES,06,100.0,CLEAR1L;F814W,WFC
";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn exposure(id: &str, filter: &str) -> Exposure {
    let mut e = Exposure::new(id, "ACS", "WFC", &[filter, "CLEAR2L"]);
    e.exposure_time = 100.0;
    e.header_wcs = Some(AstrometricSolution {
        name: "OPUS".to_string(),
        crval: (150.0, 2.0),
        crpix: (1.0, 1.0),
        pixel_scale: 0.05,
        rotation: 0.0,
    });
    e.extensions.push(Extension::science(1, Array2::from_elem((3, 3), 5.0)));
    e.extensions.push(Extension::quality(1, Array2::zeros((3, 3))));
    e
}

fn visit() -> (visit_mosaic::core::ClassifiedObset, Vec<Exposure>) {
    let mut listing = NamedTempFile::new().unwrap();
    listing.write_all(LISTING.as_bytes()).unwrap();
    listing.flush().unwrap();

    let input = read_poller_file(listing.path()).unwrap();
    let obset = classify(&input, &NamingConvention::default()).unwrap();
    let exposures = vec![
        exposure("j9es06a1q", "F606W"),
        exposure("j9es06b1q", "F606W"),
        exposure("j9es06c1q", "F814W"),
    ];
    (obset, exposures)
}

fn config() -> PipelineConfig {
    PipelineConfig {
        sky_method: SkyMethod::None,
        ..Default::default()
    }
}

/// Header aligner that refuses one exposure
struct RefusingAligner {
    refuse: &'static str,
}

impl Aligner for RefusingAligner {
    fn align(&self, exposures: &[Exposure]) -> AlignmentResults {
        let mut results = HeaderWcsAligner::default().align(exposures);
        results.insert(
            self.refuse.to_string(),
            Err(MosaicError::Alignment {
                exposure: self.refuse.to_string(),
                reason: "too few matched sources".to_string(),
            }),
        );
        results
    }
}

/// Records what it was asked to generate
#[derive(Default)]
struct RecordingCatalog {
    calls: Mutex<Vec<(usize, (usize, usize), bool, bool)>>,
}

impl CatalogGenerator for RecordingCatalog {
    fn generate(&self, request: &CatalogRequest<'_>) -> MosaicResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((request.products.len(), request.frame.shape(), request.mosaic, request.cell));
        }
        Ok(())
    }
}

/// Always fails, as a catalog step with no sources would
struct FailingCatalog;

impl CatalogGenerator for FailingCatalog {
    fn generate(&self, _request: &CatalogRequest<'_>) -> MosaicResult<()> {
        Err(MosaicError::Processing("no sources detected in the total".to_string()))
    }
}

#[test]
fn test_alignment_failure_excludes_exposure() {
    init();
    println!("=== Aligner fails for B only ===");

    let (obset, mut exposures) = visit();
    let aligner = RefusingAligner { refuse: "j9es06b1q" };
    let combiner = PointKernelCombiner::new();
    let collaborators = Collaborators {
        aligner: &aligner,
        combiner: &combiner,
        catalog: None,
    };

    let run = process_obset(&obset, &mut exposures, &collaborators, &config(), ProcessOptions::default()).unwrap();

    assert_eq!(run.status(), RunStatus::SucceededWithWarnings);
    let products = &run.report.products;
    assert_eq!(products.total().unwrap().members, vec!["j9es06a1q", "j9es06c1q"]);
    assert_eq!(products.filter("filter-f606w").unwrap().members, vec!["j9es06a1q"]);
    assert!(products.single("single-j9es06b1q").is_none());
    assert!(exposures[1].solution.is_none());
    assert_eq!(exposures[0].solution.as_ref().unwrap().name, "FIT-VISIT-GAIADR2");

    assert_eq!(run.report.excluded(), vec!["j9es06b1q"]);
    assert_eq!(run.warnings()[0].state, None);
    assert!(run.warnings()[0].reason.contains("too few matched sources"));
}

#[test]
fn test_switches_passed_through() {
    init();
    let (obset, mut exposures) = visit();
    let aligner = HeaderWcsAligner::default();
    let combiner = PointKernelCombiner::new();
    let catalog = RecordingCatalog::default();
    let collaborators = Collaborators {
        aligner: &aligner,
        combiner: &combiner,
        catalog: Some(&catalog),
    };
    let options = ProcessOptions { mosaic: false, cell: true };

    let run = process_obset(&obset, &mut exposures, &collaborators, &config(), options).unwrap();

    assert_eq!(run.status(), RunStatus::Succeeded);
    assert!(run.catalog_generated);
    assert!(run.catalog_error.is_none());
    assert_eq!(run.options, options);
    let calls = catalog.calls.lock().unwrap();
    // total + 2 filters + 3 singles
    assert_eq!(calls.as_slice(), &[(6, (3, 3), false, true)]);
}

#[test]
fn test_catalog_failure_keeps_products() {
    init();
    println!("=== Catalog failure after a finished combination ===");

    let (obset, mut exposures) = visit();
    let aligner = HeaderWcsAligner::default();
    let combiner = PointKernelCombiner::new();
    let collaborators = Collaborators {
        aligner: &aligner,
        combiner: &combiner,
        catalog: Some(&FailingCatalog),
    };

    let run = process_obset(&obset, &mut exposures, &collaborators, &config(), ProcessOptions::default()).unwrap();

    assert_eq!(run.status(), RunStatus::Succeeded);
    assert!(!run.catalog_generated);
    match run.catalog_error.as_ref() {
        Some(MosaicError::Processing(message)) => assert!(message.contains("no sources")),
        other => panic!("expected the catalog error, got {:?}", other),
    }
    assert!(run.frame().is_some());
    assert_eq!(run.report.products.iter().count(), 6);
    assert!(run.report.products.total().is_some());
}

#[test]
fn test_failed_run_skips_catalogs() {
    init();
    let (obset, mut exposures) = visit();
    for exposure in exposures.iter_mut() {
        exposure.header_wcs = None;
    }
    let aligner = HeaderWcsAligner::default();
    let combiner = PointKernelCombiner::new();
    let catalog = RecordingCatalog::default();
    let collaborators = Collaborators {
        aligner: &aligner,
        combiner: &combiner,
        catalog: Some(&catalog),
    };

    let run = process_obset(&obset, &mut exposures, &collaborators, &config(), ProcessOptions::default()).unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(!run.catalog_generated);
    assert!(run.frame().is_none());
    let failure = run.report.failure.as_ref().unwrap();
    assert_eq!(failure.failed_during, PipelineState::TotalCoarse);
    assert!(matches!(failure.error, MosaicError::TotalPipelineFailure { .. }));
    assert_eq!(run.report.excluded().len(), 3);
    assert!(catalog.calls.lock().unwrap().is_empty());
}

#[test]
fn test_products_written_and_read_back() {
    init();
    let (obset, mut exposures) = visit();
    let aligner = HeaderWcsAligner::default();
    let combiner = PointKernelCombiner::new();
    let collaborators = Collaborators {
        aligner: &aligner,
        combiner: &combiner,
        catalog: None,
    };
    let run = process_obset(&obset, &mut exposures, &collaborators, &config(), ProcessOptions::default()).unwrap();

    let dir = TempDir::new().unwrap();
    for product in run.report.products.iter() {
        ExposureFile::write_product(dir.path().join(&product.filename), product).unwrap();
    }

    let total = run.report.products.total().unwrap();
    let reread = ExposureFile::read_product(dir.path().join(&total.filename)).unwrap();
    assert_eq!(reread.label, "total");
    assert_eq!(reread.grid, total.grid);
    assert_eq!(reread.data, total.data);
    assert_eq!(reread.members, total.members);
    assert_eq!(reread.mask_sequences, total.mask_sequences);

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 6);
    assert!(names.contains(&"hst_10265_06_acs_wfc_f814w_j9es06c1_drc.fits".to_string()));
}
