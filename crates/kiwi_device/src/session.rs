//! Helpers shared by both session implementations.

use std::time::{Duration, Instant};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Pick the device a session should open.
///
/// A configured name that is still enumerated wins; a configured name that
/// vanished falls back to the first available device of that direction.
/// Without a configured name the backend's default device is preferred when
/// it is enumerated. `None` when no device is available.
pub(crate) fn resolve_device(configured: Option<&str>, default: Option<&str>, available: &[String]) -> Option<String> {
  match configured {
    Some(name) if available.iter().any(|d| d == name) => Some(name.to_string()),
    Some(name) => {
      let fallback = available.first().cloned();
      tracing::warn!(
        "Device {} is not available, falling back to {}",
        name,
        fallback.as_deref().unwrap_or("no device")
      );
      fallback
    }
    None => default
      .filter(|name| available.iter().any(|d| d == name))
      .map(str::to_string)
      .or_else(|| available.first().cloned()),
  }
}

/// Poll `is_stopped` until it reports true. Returns false when `timeout`
/// elapsed first; `None` waits indefinitely.
pub(crate) fn wait_until_stopped(mut is_stopped: impl FnMut() -> bool, timeout: Option<Duration>) -> bool {
  let started = Instant::now();
  loop {
    if is_stopped() {
      return true;
    }
    if let Some(limit) = timeout {
      if started.elapsed() >= limit {
        return false;
      }
    }
    std::thread::sleep(STOP_POLL_INTERVAL);
  }
}

/// Choose a value from `available`, preferring `requested`.
pub(crate) fn negotiate<T: Copy + PartialEq>(requested: T, available: &[T], fallback: Option<T>) -> Option<T> {
  if available.contains(&requested) {
    Some(requested)
  } else {
    fallback.filter(|f| available.contains(f)).or_else(|| available.first().copied())
  }
}
