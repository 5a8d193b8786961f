pub mod blocked_dates;
pub mod conflicts;
pub mod date_range;
pub mod models;
pub mod periods;
