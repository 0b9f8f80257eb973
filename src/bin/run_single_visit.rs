use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Instant;
use structopt::StructOpt;
use visit_mosaic::core::{
    classify, process_obset_with_previous, Collaborators, ExposureMeta, HeaderWcsAligner,
    NamingConvention, PointKernelCombiner, ProductSet, RunStatus,
};
use visit_mosaic::io::read_poller_file;
use visit_mosaic::{Exposure, ExposureFile, PipelineConfig, ProcessOptions};

#[derive(Debug, StructOpt)]
#[structopt(name = "run-single-visit", about = "Combine the exposures of one visit into mosaic products")]
struct Opt {
    /// Obset listing (poller file)
    #[structopt(parse(from_os_str))]
    poller: PathBuf,
    /// Directory holding `<id>_flc.xml` exposure files
    #[structopt(short = "i", long = "input", parse(from_os_str), default_value = ".")]
    input_dir: PathBuf,
    /// Output directory for products
    #[structopt(short = "o", long = "output", parse(from_os_str), default_value = ".")]
    output_dir: PathBuf,
    /// JSON pipeline configuration
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,
    /// Alignment frame name
    #[structopt(long = "frame", default_value = "GAIADR2")]
    frame: String,
    /// Skip the full mosaic hierarchy
    #[structopt(long = "no-mosaic")]
    no_mosaic: bool,
    /// Skip sky-cell outputs
    #[structopt(long = "no-cell")]
    no_cell: bool,
}

/// Listed directory if any, else the input directory
fn exposure_path(meta: &ExposureMeta, id: &str, input_dir: &Path) -> PathBuf {
    meta.path
        .clone()
        .unwrap_or_else(|| input_dir.join(ExposureFile::file_name(id)))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    let now = Instant::now();

    let config = match &opt.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let input = read_poller_file(&opt.poller)?;
    let obset = classify(&input, &NamingConvention::new(&config.output_suffix))?;

    let mut exposures: Vec<Exposure> = Vec::with_capacity(input.exposures.len());
    for (id, meta) in &input.exposures {
        let path = exposure_path(meta, id, &opt.input_dir);
        let exposure = ExposureFile::read(&path).with_context(|| format!("reading {}", path.display()))?;
        exposures.push(exposure);
    }

    // Earlier products in the output directory let unchanged singles be reused
    let mut previous = ProductSet::new();
    for group in obset.single_groups() {
        let path = opt.output_dir.join(&group.filename);
        if path.exists() {
            match ExposureFile::read_product(&path) {
                Ok(product) => {
                    previous.insert(product);
                }
                Err(e) => log::warn!("Ignoring unreadable product {}: {}", path.display(), e),
            }
        }
    }

    let aligner = HeaderWcsAligner { frame: opt.frame.clone() };
    let combiner = PointKernelCombiner::new();
    let collaborators = Collaborators {
        aligner: &aligner,
        combiner: &combiner,
        catalog: None,
    };
    let options = ProcessOptions {
        mosaic: !opt.no_mosaic,
        cell: !opt.no_cell,
    };

    println!("Processing {} exposure(s) of obset {} ...", exposures.len(), input.visit.obset_id);
    let run = process_obset_with_previous(&obset, &mut exposures, &collaborators, &config, options, previous)?;

    std::fs::create_dir_all(&opt.output_dir)?;
    for product in run.report.products.iter() {
        let path = opt.output_dir.join(&product.filename);
        ExposureFile::write_product(&path, product)?;
        println!("  {} -> {}", product.label, path.display());
    }

    // Cosmic-ray flags from the refined total go back to the exposure files
    if run.status() == RunStatus::Failed {
        println!("Run failed, exposure files left untouched");
    } else {
        for exposure in &exposures {
            let Some(meta) = input.exposures.get(&exposure.id) else {
                continue;
            };
            ExposureFile::write(exposure_path(meta, &exposure.id, &opt.input_dir), exposure)?;
        }
    }

    for warning in run.warnings() {
        println!("warning: {}", warning);
    }
    println!("Finished in {:.3}s: {}", now.elapsed().as_secs_f64(), run.report.summary());

    match run.status() {
        RunStatus::Failed => anyhow::bail!("visit processing failed: {}", run.report.summary()),
        _ => Ok(()),
    }
}
