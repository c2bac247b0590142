//! # sbtc-tests
//!
//! Integration tests for template assembly:
//! - Selection scenarios over dependency DAGs and the overlay
//! - Contract admission, rollback and proof-transaction rebuilds
//! - Template invariants (ordering, budgets, coinbase value, roots)

pub mod harness;

#[cfg(test)]
mod assembler_tests;


pub use harness::*;
