//! changeflow turns documentation changes into tracked work items, fans
//! each item out to a pool of solver styles, and folds their proposals back
//! into one chosen solution.
//!
//! Components share nothing in-process. They coordinate only through the
//! [`substrate`]: a durable queue, a publish/subscribe bus and an expiring
//! key-value store.

pub mod analysis;
pub mod archive;
pub mod config;
pub mod coordinator;
pub mod evaluator;
pub mod events;
pub mod gateway;
pub mod llm;
pub mod model;
pub mod solver;
pub mod substrate;
pub mod telemetry;
pub mod tracker;

#[cfg(test)]
mod testing;
