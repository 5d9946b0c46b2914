//! Shared helpers for the policy engine integration tests.
#![allow(dead_code)]

pub mod fixtures;
pub mod racing;
