//! Integration tests for winfonts
//!
//! These tests drive the extraction pipeline over mock, host-directory and
//! in-memory ISO 9660 and UDF discs.

pub mod iso;
pub mod pipeline;
