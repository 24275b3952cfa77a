//! Registries of privileged tokens and per-user devices.
//!
//! Both are read on every request and written rarely. Readers load an
//! immutable snapshot without locking; writers build a fresh snapshot and
//! publish it, serialized by a write-side mutex.

use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Set of tokens that identify privileged (never throttled) users.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    enabled: AtomicBool,
    tokens: ArcSwap<HashSet<String>>,
    write_lock: Mutex<()>,
}

impl TokenRegistry {
    /// Creates an empty, disabled registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns privilege checks on.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Turns privilege checks off; [`TokenRegistry::is_privileged`] then always fails.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Returns true if privilege checks are on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Replaces the whole token set.
    pub fn set_tokens<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next: HashSet<String> = tokens.into_iter().map(Into::into).collect();
        debug!(count = next.len(), "replacing privileged tokens");
        self.tokens.store(Arc::new(next));
    }

    /// Appends tokens to the current set.
    pub fn add_tokens<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next: HashSet<String> = (**self.tokens.load()).clone();
        next.extend(tokens.into_iter().map(Into::into));
        self.tokens.store(Arc::new(next));
    }

    /// Removes every token.
    pub fn clear_tokens(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.tokens.store(Arc::new(HashSet::new()));
    }

    /// Returns true if `token` is registered, regardless of the enabled switch.
    pub fn token_exists(&self, token: &str) -> bool {
        self.tokens.load().contains(token)
    }

    /// Returns true if the registry is enabled and `token` is registered.
    pub fn is_privileged(&self, token: &str) -> bool {
        !token.is_empty() && self.is_enabled() && self.token_exists(token)
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.tokens.load().len()
    }

    /// Returns true when no token is registered.
    pub fn is_empty(&self) -> bool {
        self.tokens.load().is_empty()
    }
}

/// Devices seen for each user.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices_per_user: ArcSwap<HashMap<u64, HashSet<String>>>,
    write_lock: Mutex<()>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `device` for `user_id`, creating the user entry if needed.
    pub fn set_user_device(&self, user_id: u64, device: impl Into<String>) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next: HashMap<u64, HashSet<String>> = (**self.devices_per_user.load()).clone();
        next.entry(user_id).or_default().insert(device.into());
        self.devices_per_user.store(Arc::new(next));
    }

    /// Devices recorded for `user_id`.
    pub fn user_devices(&self, user_id: u64) -> Option<HashSet<String>> {
        self.devices_per_user.load().get(&user_id).cloned()
    }

    /// Number of devices recorded for `user_id`.
    pub fn device_count(&self, user_id: u64) -> usize {
        self.devices_per_user
            .load()
            .get(&user_id)
            .map_or(0, HashSet::len)
    }
}
