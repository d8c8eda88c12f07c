//! Decision core for a horizontal autoscaler of LLM inference workloads.
//!
//! Three layers run every control tick: a Kalman-filtered parameter
//! tuner ([`tuner`]), a saturation analyzer ([`saturation`]), and a
//! queueing-model optimizer ([`optimizer`]), arbitrated together by
//! [`tick`].

pub mod config;
pub mod error;
pub mod model;
pub mod optimizer;
pub mod persist;
pub mod ports;
pub mod queueing;
pub mod saturation;
pub mod tick;
pub mod tuner;

pub use error::AutoscalerError;
