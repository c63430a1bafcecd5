//! Cross-module tests
//!
//! Scenario tests that run several components together: the procedure
//! pipeline, the encoder/decoder pair over line framing, router assembly
//! and the subscription session.

#[cfg(test)]
pub mod pipeline_tests;


#[cfg(test)]
pub mod session_tests;
