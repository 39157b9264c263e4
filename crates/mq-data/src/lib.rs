pub mod catalog;
pub mod store;
pub mod providers;

pub use catalog::*;
pub use store::*;
pub use providers::*;
