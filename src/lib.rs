//! # Candidate Intake Library
//!
//! Spreadsheet intake pipeline: uploaded rows are grouped into batches, each batch runs
//! through ANALYZE, STRUCTURE and INSERT jobs against rate-limited AI models, and the
//! finished upload is exported and mailed to the uploader.

pub mod ai;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod grouping;
pub mod handlers;
pub mod jobs;
pub mod json_repair;
pub mod mail;
pub mod models;
pub mod notifications;
pub mod payload;
pub mod pipeline;
pub mod prompts;
pub mod rate_limiter;
pub mod repositories;
pub mod seeder;
pub mod server;
pub mod telemetry;
pub mod workbook;
pub use migration;
