use clap::Parser;
use crosscat::config::Config;
use crosscat::driver::Engine;
use crosscat::Rng;
use rand::SeedableRng;
use std::path::Path;

/// Single-pass update of a pretrained model on new rows.
#[derive(Parser)]
#[command(name = "mix")]
struct Args {
    #[arg(value_name = "CONFIG", allow_hyphen_values = true)]
    config_in: String,
    #[arg(value_name = "MODEL_IN", allow_hyphen_values = true)]
    model_in: String,
    #[arg(value_name = "GROUPS_IN", allow_hyphen_values = true)]
    groups_in: String,
    #[arg(value_name = "ASSIGN_IN", allow_hyphen_values = true)]
    assign_in: String,
    #[arg(value_name = "TARES_IN", allow_hyphen_values = true)]
    tares_in: String,
    #[arg(value_name = "ROWS_IN", allow_hyphen_values = true)]
    rows_in: String,
    #[arg(value_name = "MODEL_OUT", allow_hyphen_values = true)]
    model_out: String,
    #[arg(value_name = "GROUPS_OUT", allow_hyphen_values = true)]
    groups_out: String,
    #[arg(value_name = "ASSIGN_OUT", allow_hyphen_values = true)]
    assign_out: String,
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
    let mut engine = Engine::load(
        config,
        &args.model_in,
        optional(&args.groups_in),
        optional(&args.assign_in),
        optional(&args.tares_in),
        &mut rng,
    )?;
    engine.mix(&mut rng, &args.rows_in)?;
    engine.dump(
        optional(&args.model_out),
        optional(&args.groups_out),
        optional(&args.assign_out),
    )
}
