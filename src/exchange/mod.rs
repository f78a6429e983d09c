mod paper;
mod traits;

pub use paper::PaperVenue;
pub use traits::{
    Dispatch, ExecutionOutcome, ExecutionReport, ExecutionVenue, VenueOrder, VenuePosition,
};
