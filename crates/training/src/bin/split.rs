use clap::Parser;
use std::path::PathBuf;
use training::util::init_tracing;
use triplet_dataset::{build_manifest_from_dir, SplitRatios};

#[derive(Parser, Debug)]
#[command(
    name = "split",
    about = "Scan <root>/<category>/<product>/ images into a train/val/test manifest"
)]
struct Args {
    /// Image root with one folder per category and one sub-folder per product.
    #[arg(long)]
    root: PathBuf,
    /// Output manifest path.
    #[arg(long, default_value = "data/splits.json")]
    out: PathBuf,
    #[arg(long, default_value_t = 0.8)]
    train: f32,
    #[arg(long, default_value_t = 0.1)]
    val: f32,
    #[arg(long, default_value_t = 0.1)]
    test: f32,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);
    let ratios = SplitRatios {
        train: args.train,
        val: args.val,
        test: args.test,
    };
    let manifest = build_manifest_from_dir(&args.root, ratios, args.seed)?;
    manifest.save(&args.out)?;
    println!(
        "wrote {} ({} categories, {} products; train {}, val {}, test {})",
        args.out.display(),
        manifest.num_categories(),
        manifest.num_products(),
        manifest.train.len(),
        manifest.val.len(),
        manifest.test.len()
    );
    Ok(())
}
