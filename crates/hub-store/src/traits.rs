use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use hub_types::{CasOutcome, HubError, KvEntry};

/// Contract over the shared key-value store every node coordinates through.
///
/// Methods use RPITIT (`-> impl Future + Send`) so that generic callers can
/// `.await` across thread boundaries without an `async-trait` dependency.
///
/// Keys live in one namespace: a key holds either a plain value (written by
/// `set`/`set_if_absent`/`compare_and_swap`) or a field mapping (written by
/// `set_field`). `delete` removes whichever is present.
///
/// The adapter never retries; every failure is surfaced to the caller.
pub trait CoordinationStore: Send + Sync + 'static {
    /// Atomically write `value` only if `key` is absent (or expired).
    /// Returns `true` when this call created the key.
    fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> impl Future<Output = Result<bool, HubError>> + Send;

    /// Return the live entry for `key`, hiding expired entries.
    fn get(&self, key: &str)
        -> impl Future<Output = Result<Option<KvEntry>, HubError>> + Send;

    /// Unconditionally write `value`. Returns the new entry version.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> impl Future<Output = Result<u64, HubError>> + Send;

    /// Replace the value only if it is currently exactly `expected`.
    /// `ttl` replaces any previous expiry.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Vec<u8>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<CasOutcome, HubError>> + Send;

    /// Delete `key` only if its value is currently exactly `expected`.
    fn compare_and_delete(&self, key: &str, expected: Vec<u8>)
        -> impl Future<Output = Result<bool, HubError>> + Send;

    /// Delete `key`. Returns whether anything was removed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, HubError>> + Send;

    /// Read the whole field mapping stored under `key` (empty if absent).
    fn get_all_fields(&self, key: &str)
        -> impl Future<Output = Result<BTreeMap<String, String>, HubError>> + Send;

    fn set_field(&self, key: &str, field: &str, value: String)
        -> impl Future<Output = Result<(), HubError>> + Send;

    /// Returns whether the field existed.
    fn delete_field(&self, key: &str, field: &str)
        -> impl Future<Output = Result<bool, HubError>> + Send;

    /// All live keys (plain or mapping) starting with `prefix`, sorted.
    fn scan_keys(&self, prefix: &str)
        -> impl Future<Output = Result<Vec<String>, HubError>> + Send;

    /// Physically remove expired plain keys. Returns how many were removed.
    fn purge_expired(&self) -> impl Future<Output = Result<usize, HubError>> + Send;
}
