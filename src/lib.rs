#![forbid(unsafe_code)]
//! Map view core for a field data collection app
//!
//! Bridges static configuration, user settings, external data and the
//! device position sensor to an imperative mapping engine.

pub mod config;
pub mod constants;
pub mod engine;
pub mod geolocation;
pub mod host;
pub mod layers;
pub mod logging;
pub mod page;
pub mod scale;
pub mod settings;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod view_persistence;
