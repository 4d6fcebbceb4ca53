//! Vehicle Studio Pipeline
//!
//! Batch background replacement for vehicle photos. Items move through a
//! rate-governed pool of processors that call a generative image API, with
//! pause, resume, cancellation and per-item reprocess, retouch and hero
//! renders on top.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
