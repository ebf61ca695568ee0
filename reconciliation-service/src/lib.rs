//! Reconciliation Service - rule-ordered matching of transaction batches.

pub mod config;
pub mod dtos;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
