pub mod block;
pub mod cat;
pub mod hyper;
pub mod kind;
pub mod proposer;

pub use block::BlockPitmanYor;
pub use cat::CatKernel;
pub use hyper::HyperKernel;
pub use kind::KindKernel;
pub use proposer::KindProposer;
