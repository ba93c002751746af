use clap::Parser;
use training::util::{init_tracing, run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    init_tracing(&args.log_level);
    run_train(args)
}
