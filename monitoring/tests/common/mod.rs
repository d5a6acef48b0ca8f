//! Shared helpers for monitoring integration tests

#![allow(dead_code)]

pub mod fixtures;
