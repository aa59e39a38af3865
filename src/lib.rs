//! Template spreader
//!
//! Populates spreadsheet templates from PDF documents. A worker claims an extraction
//! request, derives a cell schema from the uploaded xlsx template, extracts document
//! text, asks a language model for schema-constrained values and writes them back into
//! the template's own cells.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
