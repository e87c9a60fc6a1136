//! SKINSNIPER: CS2 skin marketplace sniper
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod auth;
pub mod config;
pub mod engine;
pub mod notify;
pub mod platforms;
pub mod pricing;
pub mod strategy;
pub mod types;
