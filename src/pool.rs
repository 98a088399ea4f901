//! Reusable scratch header maps.

use http::HeaderMap;
use std::{
    ops::{Deref, DerefMut},
    sync::{Mutex, PoisonError},
};

const MAX_IDLE: usize = 64;

/// Pool of [`HeaderMap`]s. Maps are cleared before they go back in, so no
/// header data is carried from one request to the next.
#[derive(Debug, Default)]
pub struct HeaderPool {
    idle: Mutex<Vec<HeaderMap>>,
}

impl HeaderPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an empty map out of the pool, allocating one if none is idle.
    pub fn acquire(&self) -> PooledHeaders<'_> {
        let map = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        PooledHeaders {
            pool: self,
            map: Some(map),
        }
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, mut map: HeaderMap) {
        map.clear();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE {
            idle.push(map);
        }
    }
}

/// A map borrowed from a [`HeaderPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledHeaders<'a> {
    pool: &'a HeaderPool,
    map: Option<HeaderMap>,
}

impl Deref for PooledHeaders<'_> {
    type Target = HeaderMap;

    fn deref(&self) -> &HeaderMap {
        self.map.as_ref().unwrap_or_else(|| unreachable!("map taken before drop"))
    }
}

impl DerefMut for PooledHeaders<'_> {
    fn deref_mut(&mut self) -> &mut HeaderMap {
        self.map.as_mut().unwrap_or_else(|| unreachable!("map taken before drop"))
    }
}

impl Drop for PooledHeaders<'_> {
    fn drop(&mut self) {
        if let Some(map) = self.map.take() {
            self.pool.release(map);
        }
    }
}
