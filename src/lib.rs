//! CFDI verification service
//!
//! Verifies Mexican tax invoices (CFDI) against the SAT verification portal
//! by driving a headless browser through its CAPTCHA-protected form, either
//! one at a time or as batches fanned out over a worker pool.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
