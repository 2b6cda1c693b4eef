pub mod assign;
pub mod config;
pub mod driver;
pub mod error;
pub mod family;
pub mod kernels;
pub mod logger;
pub mod model;
pub mod numeric;
pub mod pipeline;
pub mod schedule;
pub mod stream;
pub mod value;

pub use error::Error;
pub use error::Result;

/// dimensional analysis types
pub type Score = f32;
pub type RowId = u64;
pub type FeatureId = usize;
pub type KindId = usize;
pub type GroupId = usize;

/// the engine rng. every parallel region derives one of these
/// per task from a root seed, never by sharing.
pub type Rng = rand::rngs::SmallRng;

// annealing schedule parameters
pub const MAX_EXTRA_PASSES: f64 = 1e6;

// observed masks below this density compress to SPARSE
pub const SPARSE_THRESHOLD: f32 = 0.1;

// a slot lands in the tare when its mode covers this share of observed rows
pub const TARE_THRESHOLD: f32 = 0.5;

/// initialize logging
pub fn init() {
    std::fs::create_dir_all("logs").expect("create logs directory");
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time moves slow")
        .as_secs();
    let file = simplelog::WriteLogger::new(
        log::LevelFilter::Debug,
        config.clone(),
        std::fs::File::create(format!("logs/{}.log", time)).expect("create log file"),
    );
    let term = simplelog::TermLogger::new(
        log::LevelFilter::Info,
        config.clone(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    simplelog::CombinedLogger::init(vec![term, file]).expect("initialize logger");
}
