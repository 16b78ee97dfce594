//! CLI Commands

pub mod config;
pub mod crawl;
pub mod run;
