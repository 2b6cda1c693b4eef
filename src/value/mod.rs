pub mod differ;
pub mod observed;
pub mod product;
pub mod schema;
pub mod splitter;

pub use observed::Observed;
pub use product::Diff;
pub use product::Layout;
pub use product::ProductValue;
pub use product::Row;
pub use schema::Schema;
pub use splitter::Splitter;
