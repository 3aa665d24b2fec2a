//! Risk gating for new positions.
//!
//! - Circuit breaker on realized daily loss and the consecutive-loss streak
//! - Correlation guard on open positions per group
//! - Risk-budget position sizing

mod admission;
mod sizing;

pub use admission::{AdmissionCheck, AdmissionController, DenialReason, RiskState};
pub use sizing::PositionSizer;
