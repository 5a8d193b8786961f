pub mod calendar_repository;
pub mod config;
pub mod error;
pub mod event_mapper;
pub mod ics_client;
pub mod ics_export;
pub mod ics_parser;
pub mod logging;
pub mod storage;
