pub mod id;
pub mod position;

pub use position::{PositionState, PositionUpdate};
