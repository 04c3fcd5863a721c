//! Policy Service - access policy reconciliation and credential lifecycle
//! for a zero-trust access provider.

pub mod config;
pub mod engine;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
