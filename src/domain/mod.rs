pub mod action;
pub mod mandate;
pub mod market;
pub mod snapshot;
pub mod state;

pub use action::*;
pub use mandate::*;
pub use market::*;
pub use snapshot::*;
pub use state::*;
