//! taskq: a task-list client built around a query cache.
//!
//! The library holds everything below the terminal surface:
//! - [`query`]: the entity cache, query executor and mutation coordinator
//! - [`cursor`]: visibility-driven "load more" triggering
//! - [`session`]: the authenticated user, persisted across restarts
//! - [`todos`]: the task API, cache keys, queries and mutations

pub mod config;
pub mod cursor;
pub mod error;
pub mod logging;
pub mod query;
pub mod session;
pub mod storage;
pub mod todos;
