//! modelyard-cli library: command handlers and the SQLite engine, exposed for tests.

pub mod commands;
pub mod engine;
