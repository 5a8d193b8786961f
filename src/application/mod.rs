pub mod bootstrap;
pub mod commands;
pub mod conflicts;
pub mod ics_sync;
pub mod property_calendar;
pub mod registry;
pub mod session;
pub mod staging;
