//! Resumable crawler that copies Steam store games supporting a target
//! language into a relational store, with their user tags.

pub mod config;
pub mod database_ops;
pub mod error;
pub mod logging;
pub mod models;
pub mod normalization;
pub mod orchestrator;
pub mod util;

pub use config::CrawlerConfig;
pub use orchestrator::{Orchestrator, RunSummary};
