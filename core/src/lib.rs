//! modelyard core: entity state, actions, query scheduling and project sync.

pub mod actions;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod journal;
pub mod scheduler;
pub mod state;
pub mod sync;
pub mod util;
