//! Server-state cache, query executor and mutation coordinator.
//!
//! Inspired by TanStack Query. Reads go through a [`QueryClient`], which
//! deduplicates network calls per [`CacheKey`], serves fresh data from the
//! [`QueryCache`] and hands out observers that follow an entry as it
//! changes. Writes are [`Mutation`]s run through a fixed lifecycle with
//! optimistic updates and rollback.

mod cache;
mod client;
mod key;
pub mod mutation;
mod page;
mod state;

pub use cache::{CacheConfig, CacheEvent, CacheSnapshot, EntryState, FetchKind, QueryCache};
pub use client::{
  fetcher, FetchContext, Fetcher, InfiniteOptions, InfiniteQueryObserver, NextPage, PageFetcher,
  QueryClient, QueryObserver, QueryOptions,
};
pub use key::{CacheKey, KeyPart};
pub use mutation::{Mutation, MutationCache};
pub use page::{InfiniteData, PaginatedResult};
pub use state::{MutationStatus, QueryResult, QueryStatus};
