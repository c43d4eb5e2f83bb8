//! Raster alignment job service
//!
//! This library provides the job orchestration core of the raster-align
//! system: a file-backed job store, supervision of the external clip/align
//! worker, and the polling API clients use to follow a job to completion.

pub mod app_state;
pub mod client;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
