//! Visibility-driven "load more" for infinite lists.
//!
//! A [`CursorController`] binds one element (the sentinel at the end of a
//! list) to a callback through a [`VisibilityObserver`]. Each time the
//! observer reports the element as intersecting the viewport, the callback
//! runs. The callback is expected to be guarded itself, see
//! [`NextPage::fetch`](crate::query::NextPage::fetch).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::query::NextPage;

/// Opaque identity of an observable element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle(u64);

impl ElementHandle {
  pub fn new() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Self(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for ElementHandle {
  fn default() -> Self {
    Self::new()
  }
}

pub type VisibilityCallback = Arc<dyn Fn() + Send + Sync>;

/// Platform visibility primitive.
pub trait VisibilityObserver: Send + Sync {
  /// Start reporting `element`; `callback` runs on every intersecting event.
  /// Observing an element again replaces its callback.
  fn observe(&self, element: ElementHandle, callback: VisibilityCallback);

  /// Stop reporting `element` and release its callback.
  fn unobserve(&self, element: ElementHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
  Unobserved,
  Observed(ElementHandle),
}

/// Binds one element's visibility to one callback at a time.
pub struct CursorController {
  observer: Arc<dyn VisibilityObserver>,
  state: CursorState,
}

impl CursorController {
  pub fn new(observer: Arc<dyn VisibilityObserver>) -> Self {
    Self {
      observer,
      state: CursorState::Unobserved,
    }
  }

  /// Begin observing `element`. Any previous observation is torn down first.
  pub fn attach(&mut self, element: ElementHandle, callback: VisibilityCallback) {
    self.detach();
    debug!(?element, "cursor observing element");
    self.observer.observe(element, callback);
    self.state = CursorState::Observed(element);
  }

  /// Swap the callback of the observed element. Does nothing when detached.
  pub fn rebind(&mut self, callback: VisibilityCallback) {
    if let CursorState::Observed(element) = self.state {
      self.attach(element, callback);
    }
  }

  /// Stop observing. Safe to call when already detached.
  pub fn detach(&mut self) {
    if let CursorState::Observed(element) = self.state {
      debug!(?element, "cursor released element");
      self.observer.unobserve(element);
      self.state = CursorState::Unobserved;
    }
  }

  pub fn is_observed(&self) -> bool {
    matches!(self.state, CursorState::Observed(_))
  }

  pub fn element(&self) -> Option<ElementHandle> {
    match self.state {
      CursorState::Observed(element) => Some(element),
      CursorState::Unobserved => None,
    }
  }
}

impl Drop for CursorController {
  fn drop(&mut self) {
    self.detach();
  }
}

/// Callback that loads the next page of an infinite query in the background.
///
/// Repeated events while a page is loading are absorbed by the query's own
/// in-flight guard.
pub fn fetch_next_page_on_visible<T>(next: NextPage<T>) -> VisibilityCallback
where
  T: Clone + Send + Sync + 'static,
{
  Arc::new(move || {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!("visibility event outside the runtime, next page not loaded");
      return;
    };
    let next = next.clone();
    runtime.spawn(async move {
      if let Err(error) = next.fetch().await {
        warn!(%error, "failed to load next page");
      }
    });
  })
}

#[derive(Default)]
struct ViewportState {
  callbacks: HashMap<ElementHandle, VisibilityCallback>,
  visible: HashSet<ElementHandle>,
}

/// In-process [`VisibilityObserver`] fed by the renderer.
///
/// The renderer reports which elements ended up on screen; observed elements
/// that are on screen get their callback run. An element that is already
/// visible when observed fires once right away.
#[derive(Default)]
pub struct Viewport {
  state: Mutex<ViewportState>,
}

impl Viewport {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, ViewportState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Record whether `element` intersects the viewport, running its callback
  /// if it does.
  pub fn report(&self, element: ElementHandle, intersecting: bool) {
    let callback = {
      let mut state = self.state();
      if intersecting {
        state.visible.insert(element);
        state.callbacks.get(&element).cloned()
      } else {
        state.visible.remove(&element);
        None
      }
    };
    if let Some(callback) = callback {
      callback();
    }
  }

  /// Number of elements currently observed.
  pub fn observed(&self) -> usize {
    self.state().callbacks.len()
  }
}

impl VisibilityObserver for Viewport {
  fn observe(&self, element: ElementHandle, callback: VisibilityCallback) {
    let fire = {
      let mut state = self.state();
      state.callbacks.insert(element, callback.clone());
      state.visible.contains(&element)
    };
    if fire {
      callback();
    }
  }

  fn unobserve(&self, element: ElementHandle) {
    self.state().callbacks.remove(&element);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache_key;
  use crate::query::{fetcher, CacheConfig, InfiniteOptions, PaginatedResult, QueryClient};
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  fn counter() -> (Arc<AtomicU32>, VisibilityCallback) {
    let hits = Arc::new(AtomicU32::new(0));
    let cb_hits = hits.clone();
    let callback: VisibilityCallback = Arc::new(move || {
      cb_hits.fetch_add(1, Ordering::SeqCst);
    });
    (hits, callback)
  }

  #[test]
  fn test_callback_runs_only_when_intersecting() {
    let viewport = Arc::new(Viewport::new());
    let mut cursor = CursorController::new(viewport.clone());
    let sentinel = ElementHandle::new();
    let (hits, callback) = counter();

    cursor.attach(sentinel, callback);
    viewport.report(sentinel, false);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    viewport.report(sentinel, true);
    viewport.report(sentinel, true);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_rebind_does_not_leak_observers() {
    let viewport = Arc::new(Viewport::new());
    let mut cursor = CursorController::new(viewport.clone());
    let sentinel = ElementHandle::new();
    let (old_hits, old) = counter();
    let (new_hits, new) = counter();

    cursor.attach(sentinel, old);
    cursor.rebind(new);
    assert_eq!(viewport.observed(), 1);

    viewport.report(sentinel, true);
    assert_eq!(old_hits.load(Ordering::SeqCst), 0);
    assert_eq!(new_hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_attaching_new_element_releases_old_one() {
    let viewport = Arc::new(Viewport::new());
    let mut cursor = CursorController::new(viewport.clone());
    let first = ElementHandle::new();
    let second = ElementHandle::new();
    let (hits, callback) = counter();

    cursor.attach(first, callback.clone());
    cursor.attach(second, callback);
    assert_eq!(viewport.observed(), 1);
    assert_eq!(cursor.element(), Some(second));

    viewport.report(first, true);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_detach_and_drop_stop_observation() {
    let viewport = Arc::new(Viewport::new());
    let sentinel = ElementHandle::new();
    let (hits, callback) = counter();
    {
      let mut cursor = CursorController::new(viewport.clone());
      cursor.attach(sentinel, callback.clone());
      cursor.detach();
      assert!(!cursor.is_observed());
      assert_eq!(viewport.observed(), 0);

      cursor.attach(sentinel, callback);
    }
    assert_eq!(viewport.observed(), 0);
    viewport.report(sentinel, true);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_already_visible_element_fires_on_observe() {
    let viewport = Arc::new(Viewport::new());
    let mut cursor = CursorController::new(viewport.clone());
    let sentinel = ElementHandle::new();
    let (hits, callback) = counter();

    viewport.report(sentinel, true);
    cursor.attach(sentinel, callback);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_repeated_visibility_loads_one_page() {
    let client = QueryClient::new(CacheConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let pages = fetcher(move |ctx| {
      counter.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let n = ctx.page_param.unwrap_or(1);
        Ok(PaginatedResult {
          first: 1,
          prev: (n > 1).then(|| n - 1),
          next: (n < 3).then(|| n + 1),
          last: 3,
          pages: 3,
          items: 3,
          data: vec![n],
        })
      }
    });
    let mut feed = client.watch_infinite(cache_key!["feed"], pages, InfiniteOptions::default());
    while feed.result().data.is_none() {
      feed.changed().await;
    }

    let viewport = Arc::new(Viewport::new());
    let mut cursor = CursorController::new(viewport.clone());
    let sentinel = ElementHandle::new();
    cursor.attach(sentinel, fetch_next_page_on_visible(feed.next_page()));
    for _ in 0..3 {
      viewport.report(sentinel, true);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(feed.items(), vec![1, 2]);
  }
}
