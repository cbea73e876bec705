//! sast-triage library crate
//!
//! Exposes the adjudication pipeline so the CLI, benchmarks and external
//! tooling can drive individual stages without going through CLI startup.

pub mod adjudicate;
pub mod config;
pub mod evaluation;
pub mod evidence;
pub mod finding;
pub mod known_issues;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod report;
