//! Shared test utilities for syncstream integration tests.
//!
//! This module provides:
//! - `ScriptedTransport`, an in-memory transport serving canned chunk scripts
//! - `TestHarness` wiring a registry to that transport and a memory store
//! - helpers for building wire frames and waiting on async state

#![allow(dead_code)]

pub mod harness;
pub mod transport;

pub use harness::{frame, wait_for, wait_for_within, TestHarness};
pub use transport::{live, Script, ScriptedTransport};
