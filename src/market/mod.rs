//! Market domain: instruments, decisions, trading windows and the
//! instrument catalog.

mod catalog;
mod types;
pub mod window;

pub use catalog::{infer_instrument, InstrumentCatalog, StaticCatalog};
#[cfg(test)]
pub use catalog::MockInstrumentCatalog;
pub use types::{Action, Category, Decision, Instrument, TradeSetup};
