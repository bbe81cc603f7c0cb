//! Basil: an HTTP application server whose page and API handlers are
//! written in an embedded scripting language (spec.md §1 OVERVIEW). This
//! crate owns the HTTP surface, routing, caching, sessions, and the
//! evaluator contract; the script language itself is an external
//! collaborator (`value::Evaluator`).

pub mod assets;
pub mod cache;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod error_renderer;
pub mod middleware;
pub mod page;
pub mod prelude;
pub mod rate_limit;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod state;
pub mod value;
pub mod watcher;

pub use config::Config;
pub use error::{Error, Result};
pub use server::{BasilServer, BasilServerBuilder};
pub use state::{AppState, AppStateBuilder};
