//! # Signal Hub
//!
//! Produces trading decisions for a universe of instruments on a fixed
//! cadence, gates them through market-hour and risk checks, and distributes
//! them to live subscribers.
//!
//! ## Architecture
//!
//! - `market`: Instruments, decisions, trading windows and the instrument catalog
//! - `decision`: Decision providers (remote model endpoint, hold-only fallback)
//! - `risk`: Circuit breaker, correlation guard and position sizing
//! - `bus`: Latest decision per instrument with change notifications (memory or Redis)
//! - `scheduler`: Periodic bounded-concurrency scan cycles
//! - `relay`: Per-symbol fan-out to WebSocket clients
//! - `alerts`: Outbound notifications for newly actionable signals
//! - `persistence`: SQLite position journal and duplicate-open protection
//! - `config`: Configuration management and validation
//! - `utils`: Shared utilities and decimal arithmetic

pub mod alerts;
pub mod bus;
pub mod config;
pub mod decision;
pub mod market;
pub mod persistence;
pub mod relay;
pub mod risk;
pub mod scheduler;
pub mod utils;

pub use config::Config;
