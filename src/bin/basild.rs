//! The `basild` binary: loads configuration, wires up an `AppState`, and
//! serves it. The actual script evaluator is out of scope for this crate
//! (spec.md §1 Non-goals) — `NullEvaluator` stands in for it here so the
//! binary builds and runs end-to-end against the request-dispatch core.

use std::sync::Arc;

use basil::config::Config;
use basil::value::{NullEvaluator, Value};
use basil::{AppState, BasilServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_else(|err| {
        eprintln!("failed to load configuration, using defaults: {err}");
        Config::default()
    });

    let evaluator: Arc<dyn basil::value::Evaluator> = Arc::new(NullEvaluator { result: Value::Null });
    let state = AppState::builder(evaluator).config(config).build()?;

    BasilServer::builder(state).init_tracing().build()?.serve().await?;

    Ok(())
}
