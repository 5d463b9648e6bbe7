//! Property-based tests entry point
//!
//! Includes the test modules from the property/ subdirectory so they compile
//! into one test binary.

mod property;
