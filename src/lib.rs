pub mod api;
pub mod artwork;
pub mod channels;
pub mod config;
pub mod context;
pub mod epg;
pub mod errors;
pub mod flex_id;
pub mod lru_cache;
pub mod program;
pub mod session;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
