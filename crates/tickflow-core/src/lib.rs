//! Durable workflow engine built on replay with memoization.
//!
//! A workflow is an ordinary async function over a [`step::Step`] handle.
//! Each scheduling round (a "tick") replays the function from the top:
//! already-resolved ops return their memoized results instantly, and the
//! first batch of unresolved ops suspends the replay so the engine can
//! execute or schedule them. Handlers therefore run at most once per op
//! attempt even though the surrounding function body runs many times.
//!
//! The layering, bottom to top:
//! - [`ident`] deterministic op identity
//! - [`gate`] the suspension primitive ops park on
//! - [`step`] the user-facing op API
//! - [`discovery`] one replay pass over a workflow function
//! - [`driver`] discovery + memo lookups + handler execution
//! - [`engine`] the orchestrator tying runs, queues, and stores together
//! - [`checkpoint`] a request/response surface for remote runners

pub mod checkpoint;
pub mod discovery;
pub mod driver;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ident;
pub mod memory;
pub mod queue;
pub mod step;
pub mod store;
pub mod trigger;
pub mod validate;
pub mod workflow;

pub use engine::Engine;
pub use error::EngineError;
pub use step::Step;
pub use workflow::{Workflow, WorkflowCtx};
