pub mod alarm;
pub mod arbitration;
pub mod checkin;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod device_config;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod ranges;
pub mod registry;
pub mod rest;
pub mod sweeper;
pub mod telemetry;
pub mod validate;
