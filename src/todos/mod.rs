//! Task-list domain: wire types, HTTP API, cache keys, queries and writes.

mod api;
pub mod keys;
mod mutations;
mod queries;
mod types;

pub use api::TaskApi;
pub use mutations::{CreateTodo, DeleteTodo, TodoActions, ToggleTodo};
pub use queries::{TodoQueries, DEFAULT_PER_PAGE};
pub use types::{Credentials, Todo, TodoPage, TodoPatch, User};
