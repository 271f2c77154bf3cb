pub mod broadcast;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod error;
pub mod field_value;
pub mod geometry;
pub mod ids;
pub mod model;
pub mod operations;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use debounce::Debouncer;
pub use error::CoreError;
pub use field_value::{SpaceField, SpaceFieldValue};
pub use ids::*;
pub use model::*;
