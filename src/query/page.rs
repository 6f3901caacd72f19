//! Cursor-paginated payloads and the page sequence of an infinite query.

use serde::{Deserialize, Serialize};

/// One page of a paginated listing, as served by the API.
///
/// `prev` is `None` exactly on the first page and `next` is `None` exactly on
/// the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
  pub first: u32,
  pub prev: Option<u32>,
  pub next: Option<u32>,
  pub last: u32,
  pub pages: u32,
  pub items: u32,
  pub data: T,
}

impl<T> PaginatedResult<T> {
  pub fn is_last(&self) -> bool {
    self.next.is_none()
  }
}

/// Pages of an infinite query, in fetch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfiniteData<T> {
  pub pages: Vec<PaginatedResult<Vec<T>>>,
  /// Cursor each page was fetched with, parallel to `pages`
  pub page_params: Vec<u32>,
}

impl<T> Default for InfiniteData<T> {
  fn default() -> Self {
    Self {
      pages: Vec::new(),
      page_params: Vec::new(),
    }
  }
}

impl<T> InfiniteData<T> {
  pub fn push(&mut self, param: u32, page: PaginatedResult<Vec<T>>) {
    self.page_params.push(param);
    self.pages.push(page);
  }

  /// Cursor for the page after the last loaded one.
  pub fn next_page_param(&self) -> Option<u32> {
    self.pages.last().and_then(|p| p.next)
  }

  pub fn has_next_page(&self) -> bool {
    self.next_page_param().is_some()
  }

  /// All items of all pages, concatenated in page order.
  pub fn items(&self) -> impl Iterator<Item = &T> {
    self.pages.iter().flat_map(|p| p.data.iter())
  }
}

impl<T: Clone> InfiniteData<T> {
  pub fn flatten(&self) -> Vec<T> {
    self.items().cloned().collect()
  }
}
