use std::collections::BTreeMap;
use visit_mosaic::core::classify::{classify, ClassifiedObset, ExposureMeta, NamingConvention, ObsetInput, VisitInfo};
use visit_mosaic::io::parse_poller;
use visit_mosaic::{MosaicError, ObsetGroup, ProductKind};

fn visit() -> VisitInfo {
    VisitInfo {
        proposal_id: "10265".to_string(),
        obset_id: "06".to_string(),
        instrument: "ACS".to_string(),
        detector: "WFC".to_string(),
    }
}

fn meta(filter: &str) -> ExposureMeta {
    ExposureMeta {
        instrument: "ACS".to_string(),
        detector: "WFC".to_string(),
        filters: vec![filter.to_string(), "CLEAR2L".to_string()],
        exposure_time: 500.0,
        path: None,
    }
}

fn input(entries: &[(&str, &str)]) -> ObsetInput {
    ObsetInput {
        visit: visit(),
        exposures: entries
            .iter()
            .map(|(id, filter)| (id.to_string(), meta(filter)))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn group(label: &str, kind: ProductKind, members: &[&str]) -> ObsetGroup {
    ObsetGroup {
        label: label.to_string(),
        kind,
        filter_tag: None,
        members: members.iter().map(|m| m.to_string()).collect(),
        filename: format!("{}.fits", label),
    }
}

#[test]
fn test_three_exposure_scenario() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("=== A,B in F1 and C in F2 ===");

    let obset = classify(
        &input(&[("j9es06a1q", "F1"), ("j9es06b1q", "F1"), ("j9es06c1q", "F2")]),
        &NamingConvention::default(),
    )
    .unwrap();

    assert_eq!(obset.total().members, vec!["j9es06a1q", "j9es06b1q", "j9es06c1q"]);
    assert_eq!(obset.total().kind, ProductKind::Total);

    let filters: Vec<(&str, &[String])> = obset
        .filter_groups()
        .map(|g| (g.label.as_str(), g.members.as_slice()))
        .collect();
    assert_eq!(filters.len(), 2);
    assert_eq!(filters[0].0, "filter-f1");
    assert_eq!(filters[0].1, ["j9es06a1q", "j9es06b1q"]);
    assert_eq!(filters[1].0, "filter-f2");
    assert_eq!(filters[1].1, ["j9es06c1q"]);

    let singles: Vec<&str> = obset.single_groups().map(|g| g.label.as_str()).collect();
    assert_eq!(singles, vec!["single-j9es06a1q", "single-j9es06b1q", "single-j9es06c1q"]);
    for single in obset.single_groups() {
        assert_eq!(single.members.len(), 1);
    }
    assert_eq!(obset.groups().len(), 6);

    assert_eq!(obset.total().filename, "hst_10265_06_acs_wfc_total_drc.fits");
    assert_eq!(obset.group("filter-f2").unwrap().filename, "hst_10265_06_acs_wfc_f2_drc.fits");
    assert_eq!(
        obset.single_for("j9es06c1q").unwrap().filename,
        "hst_10265_06_acs_wfc_f2_j9es06c1_drc.fits"
    );
}

#[test]
fn test_filenames_deterministic() {
    let listing = "\
j9es06rbq_flc.fits,10265,9ES,06,500.0,F606W;CLEAR2L,WFC
j9es06rcq_flc.fits,10265,9ES,06,500.0,F606W;CLEAR2L,WFC
j9es06req_flc.fits,10265,9ES,06,340.0,CLEAR1L;F814W,WFC
";
    let naming = NamingConvention::new("drc");
    let first = classify(&parse_poller(listing).unwrap(), &naming).unwrap();
    let second = classify(&parse_poller(listing).unwrap(), &naming).unwrap();

    let names = |obset: &ClassifiedObset| -> Vec<String> {
        obset.groups().iter().map(|g| g.filename.clone()).collect()
    };
    assert_eq!(names(&first), names(&second));
    assert_eq!(first, second);
}

#[test]
fn test_no_total_group() {
    let groups = vec![
        group("filter-f1", ProductKind::Filter, &["a"]),
        group("single-a", ProductKind::SingleExposure, &["a"]),
    ];
    match ClassifiedObset::from_groups(visit(), groups) {
        Err(MosaicError::NoTotalProduct { found }) => assert_eq!(found, 0),
        other => panic!("expected NoTotalProduct, got {:?}", other),
    }
}

#[test]
fn test_two_total_groups() {
    let groups = vec![
        group("total", ProductKind::Total, &["a"]),
        group("total-extra", ProductKind::Total, &["a"]),
        group("filter-f1", ProductKind::Filter, &["a"]),
        group("single-a", ProductKind::SingleExposure, &["a"]),
    ];
    match ClassifiedObset::from_groups(visit(), groups) {
        Err(MosaicError::NoTotalProduct { found }) => assert_eq!(found, 2),
        other => panic!("expected NoTotalProduct, got {:?}", other),
    }
}

#[test]
fn test_empty_input_has_no_total() {
    let result = classify(&input(&[]), &NamingConvention::default());
    assert!(matches!(result, Err(MosaicError::NoTotalProduct { found: 0 })));
}

#[test]
fn test_single_name_collision() {
    // Ids differing only in the ninth character share a truncated name
    let result = classify(
        &input(&[("j9es06rbq", "F606W"), ("j9es06rbr", "F606W")]),
        &NamingConvention::default(),
    );
    match result {
        Err(MosaicError::NamingCollision { filename, first, second }) => {
            assert_eq!(filename, "hst_10265_06_acs_wfc_f606w_j9es06rb_drc.fits");
            assert_eq!(first, "single-j9es06rbq");
            assert_eq!(second, "single-j9es06rbr");
        }
        other => panic!("expected NamingCollision, got {:?}", other),
    }
}

#[test]
fn test_member_in_two_filter_groups() {
    let groups = vec![
        group("total", ProductKind::Total, &["a"]),
        group("filter-f1", ProductKind::Filter, &["a"]),
        group("filter-f2", ProductKind::Filter, &["a"]),
        group("single-a", ProductKind::SingleExposure, &["a"]),
    ];
    assert!(matches!(
        ClassifiedObset::from_groups(visit(), groups),
        Err(MosaicError::Processing(_))
    ));
}

#[test]
fn test_exposure_id_spelling_total() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("=== Exposure ids that contain 'total' ===");

    let obset = classify(
        &input(&[("jtotal01q", "F606W"), ("j9es06b1q", "F606W"), ("jtotal02q", "F814W")]),
        &NamingConvention::default(),
    )
    .unwrap();

    assert_eq!(obset.total().label, "total");
    assert_eq!(obset.total().members.len(), 3);
    let single = obset.single_for("jtotal01q").unwrap();
    assert_eq!(single.label, "single-jtotal01q");
    assert_eq!(single.kind, ProductKind::SingleExposure);
    assert_eq!(obset.single_groups().count(), 3);
}
