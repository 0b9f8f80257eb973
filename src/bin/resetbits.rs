use std::path::PathBuf;
use std::time::Instant;
use structopt::StructOpt;
use visit_mosaic::{ExtensionVersion, ResetBits};

#[derive(Debug, StructOpt)]
#[structopt(name = "resetbits", about = "Clear flag bits in exposure quality planes")]
struct Opt {
    /// Exposure file, or a comma-separated list of files, updated in place
    input: String,
    /// Bits to clear: a sum or a list such as "4096" or "2,32,64,4096"
    bits: String,
    /// Only edit this extension version (default: every version)
    #[structopt(short = "v", long = "extver")]
    extver: Option<u32>,
    /// Extension name of the quality planes
    #[structopt(short = "n", long = "extname", default_value = "dq")]
    extname: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    let now = Instant::now();
    let files: Vec<PathBuf> = opt
        .input
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(PathBuf::from)
        .collect();
    if files.is_empty() {
        anyhow::bail!("no input files given");
    }

    let reset = ResetBits::parse(&opt.bits)?
        .with_extver(ExtensionVersion::from(opt.extver))
        .with_extname(&opt.extname);

    println!(
        "Clearing bits {} in {}[{}] of {} file(s) ...",
        reset.bits(),
        opt.extname,
        ExtensionVersion::from(opt.extver),
        files.len()
    );
    let planes = reset.apply_to_files(&files)?;
    println!("Updated {} plane(s) in {:.3}s", planes, now.elapsed().as_secs_f64());
    Ok(())
}
