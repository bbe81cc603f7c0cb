//! SessionStore (spec.md §3, §9 "Session cookie ownership") and the CSRF
//! token type. The store owns all session cookie writes; PageHandler calls
//! `commit` after `Eval` to flush whatever the script marked dirty.

pub mod csrf;
pub mod store;

pub use csrf::{verify_csrf_token, CsrfToken};
pub use store::{MemorySessionStore, SessionCookieAttrs, SessionData, SessionStore};
