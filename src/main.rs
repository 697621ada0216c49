//! Trains the tutorial network `x(3) -> MatMul -> Relu -> MatMul -> y(1)` on the toy regression
//! `y = x1 + 2 * x2^2 + 3 * x3^0.5` using the library provided by `gradnet`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run
//! ```
//!
//! Supports a custom learning rate, optimizer, batch size, etc.

use std::error::Error;

use clap::{Parser, ValueEnum};
use gradnet::{
    dataloader::DataLoader,
    datasets::gen_regression_data,
    net::NetConfig,
    optim::OptimizerConfig,
    trainer::{RegressionModel, train},
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Optimizer {
    Adam,
    Sgd,
}

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = 1000)]
    samples: usize,
    #[clap(short, long, default_value_t = 1)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 1000)]
    iterations: usize,
    #[clap(short, long, default_value_t = 0.01)]
    lr: f32,
    #[clap(short, long, value_enum, default_value_t = Optimizer::Adam)]
    optimizer: Optimizer,
    /// Only used by SGD
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(short, long, default_value_t = 100)]
    print_every: usize,
    #[clap(long, default_value_t = 5)]
    hidden_units: usize,
    #[clap(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let (data, targets) = gen_regression_data(args.samples, &mut rng);
    let loader = DataLoader::new(data, targets, args.batch_size, true)?;

    let optimizer = match args.optimizer {
        Optimizer::Adam => OptimizerConfig::default(),
        Optimizer::Sgd => OptimizerConfig::Sgd {
            momentum: args.momentum,
        },
    };
    let config = NetConfig {
        learning_rate: args.lr,
        optimizer,
    };
    let mut model =
        RegressionModel::build(args.batch_size, 3, args.hidden_units, config, args.seed)?;

    let checkpoints = train(&mut model, &loader, args.iterations, args.print_every, &mut rng)?;
    for checkpoint in &checkpoints {
        println!("iteration {:>5}  cost {:.4}", checkpoint.iteration, checkpoint.cost);
    }
    Ok(())
}
