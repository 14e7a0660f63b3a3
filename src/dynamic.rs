//! DynamicConfig handles for live-updatable config.
//!
//! Backed by `ArcSwap` for lock-free reads on the request path. Rate-limit parameters are held in
//! one of these so a deployment can override them without restarting.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let cur = self.inner.load_full();
        self.inner.store(Arc::new(f(&cur)));
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;

    #[test]
    fn clones_observe_updates() {
        let a = DynamicConfig::new(1);
        let b = a.clone();
        a.set(2);
        assert_eq!(*b.get(), 2);
        b.update(|v| v + 3);
        assert_eq!(*a.get(), 5);
    }
}
