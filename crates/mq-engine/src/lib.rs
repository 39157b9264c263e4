pub mod reconcile;
pub mod history;
pub mod scheduler;

pub use reconcile::*;
pub use history::*;
pub use scheduler::*;
