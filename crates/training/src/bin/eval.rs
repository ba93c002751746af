use clap::Parser;
use std::path::PathBuf;
use training::util::{
    eval_loader, init_tracing, load_manifest, num_classes, validate_backend_choice, write_results,
    BackendKind, TestResults,
};
use training::{test_gathered, LabelSpace, LossMode, TrainBackend, TripletCriterion, TripletNetConfig};
use triplet_dataset::Split;

#[derive(Parser, Debug)]
#[command(name = "eval", about = "Evaluate a trained triplet network on one manifest split")]
struct Args {
    /// Checkpoint (burn record) to load.
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long, default_value = "data/splits.json")]
    split_manifest: PathBuf,
    /// Image root; overrides the manifest's `root`.
    #[arg(long)]
    ims_path: Option<PathBuf>,
    /// train, val or test.
    #[arg(long, default_value = "test")]
    split: Split,
    #[arg(long, default_value = "rexnet_150")]
    model_name: String,
    #[arg(long)]
    conv_input: bool,
    #[arg(long, value_enum, default_value_t = LabelSpace::Product)]
    label_space: LabelSpace,
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
    #[arg(long, default_value_t = 224)]
    input_size: u32,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    only_feature_embeddings: bool,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    only_target_labels: bool,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Write the results JSON here.
    #[arg(long)]
    results_out: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);
    validate_backend_choice(args.backend)?;

    let mode = LossMode::new(args.only_feature_embeddings, args.only_target_labels)?;
    let manifest = load_manifest(&args.split_manifest, args.ims_path.as_deref())?;
    let classes = num_classes(&manifest, args.label_space);
    let mut loader = eval_loader(&manifest, args.split, args.batch_size, args.input_size, args.seed)?;

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let model = TripletNetConfig::from_name(&args.model_name, classes)?
        .with_conv_input(args.conv_input)
        .init::<TrainBackend>(&device)?
        .load_pretrained(&args.checkpoint, &device)?;
    let criterion = TripletCriterion::<TrainBackend>::new(mode, &device);

    let metrics = test_gathered(&model, &criterion, &mut loader, args.label_space, &device)?;
    let results = TestResults::from(&metrics);
    println!("{}", serde_json::to_string_pretty(&results)?);
    println!(
        "{} samples from {} split, mean raw similarity {:.4}",
        metrics.samples, args.split, metrics.mean_similarity
    );
    if let Some(path) = &args.results_out {
        write_results(path, &results)?;
    }
    Ok(())
}
