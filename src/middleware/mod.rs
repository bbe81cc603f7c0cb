//! The middleware chain (spec.md §4.13), applied bottom-up so the outermost
//! wrapper runs first: logging → security headers → proxy-aware remote
//! address → compression → CORS → CSRF → router.

pub mod csrf_layer;
pub mod proxy;
pub mod security_headers;

pub use csrf_layer::csrf_guard;
pub use proxy::{resolve_remote_addr, RemoteAddr};
pub use security_headers::apply_security_headers;
