use clap::Parser;
use crosscat::config::Config;
use crosscat::driver::Engine;
use crosscat::Rng;
use rand::SeedableRng;
use std::path::Path;

/// Synthesise rows from a model's prior.
#[derive(Parser)]
#[command(name = "generate")]
struct Args {
    #[arg(value_name = "CONFIG", allow_hyphen_values = true)]
    config_in: String,
    #[arg(value_name = "MODEL_IN", allow_hyphen_values = true)]
    model_in: String,
    #[arg(value_name = "ROWS_OUT", allow_hyphen_values = true)]
    rows_out: String,
}

fn optional(path: &str) -> Option<&str> {
    (path != "--none").then_some(path)
}

fn main() {
    crosscat::init();
    let args = Args::parse();
    if let Err(error) = run(&args) {
        log::error!("{}", error);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> crosscat::Result<()> {
    let config = match optional(&args.config_in) {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::default(),
    };
    let mut rng = Rng::seed_from_u64(config.seed);
    let mut engine = Engine::load(config, &args.model_in, None, None, None, &mut rng)?;
    engine.generate(&mut rng, &args.rows_out)
}
