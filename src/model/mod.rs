pub mod crosscat;
pub mod indexed;
pub mod mixture;
pub mod product;
pub mod tracker;

pub use crosscat::assemble;
pub use crosscat::CrossCat;
pub use crosscat::Kind;
pub use indexed::IndexedVector;
pub use mixture::CacheMode;
pub use mixture::ProductMixture;
pub use product::ProductModel;
pub use tracker::IdTracker;
