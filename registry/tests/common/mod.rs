//! Shared helpers for registry integration tests

#![allow(dead_code)]

pub mod fixtures;
