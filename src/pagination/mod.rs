//! Page-by-page loading of paginated documents.
//!
//! Both strategies issue page requests through sibling document stores
//! with cache subscriptions disabled, so the merged list only ever reaches
//! the wrapped document through the cache.

mod cursor;
mod offset;
mod page_info;

use std::sync::atomic::{AtomicBool, Ordering};

pub use cursor::CursorPaginator;
pub use offset::OffsetPaginator;
pub use page_info::{count_items, count_json_items, PageInfo};

use crate::error::{CacheError, PageDirection, Result};

/// Marks a direction as loading until dropped.
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
  fn acquire(flag: &'a AtomicBool, direction: PageDirection) -> Result<Self> {
    if flag.swap(true, Ordering::SeqCst) {
      return Err(CacheError::AlreadyLoading(direction));
    }
    Ok(Self(flag))
  }
}

impl Drop for LoadingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_guard_rejects_second_load_until_dropped() {
    let flag = AtomicBool::new(false);
    let guard = LoadingGuard::acquire(&flag, PageDirection::Forward).unwrap();
    assert_eq!(
      LoadingGuard::acquire(&flag, PageDirection::Forward).err(),
      Some(CacheError::AlreadyLoading(PageDirection::Forward))
    );
    drop(guard);
    assert!(LoadingGuard::acquire(&flag, PageDirection::Forward).is_ok());
  }
}
