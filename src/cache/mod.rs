//! The three request-keyed caches (spec.md §4.1–4.3): ScriptCache,
//! ResponseCache, and FragmentCache. Each protects its internal map with
//! its own concurrency strategy (spec.md §5): `DashMap` sharding for the
//! two high-churn caches, a single `RwLock` around an `LruCache` for the
//! bounded fragment cache.

pub mod fragment;
pub mod response;
pub mod script;

pub use fragment::FragmentCache;
pub use response::ResponseCache;
pub use script::ScriptCache;
