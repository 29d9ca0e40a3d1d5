//! `tarsy-engine` — the processing engine: chain execution, session
//! lifecycle, cross-replica work distribution and hook fan-out.
//!
//! The moving parts, wired together by the gateway at startup:
//! - [`ingress::AlertService`] validates alerts, applies queue admission
//!   and creates PENDING sessions.
//! - [`worker::WorkerPool`] claims PENDING sessions atomically and runs
//!   them through the [`executor::ChainExecutor`].
//! - [`cancel::CancellationTracker`] distinguishes user cancels from
//!   timeouts; the cancellations listener propagates cancels across
//!   replicas.
//! - [`hooks::EngineHooks`] persists every interaction and publishes the
//!   matching notification event.
//! - [`background`] holds the sweepers: orphan recovery, history
//!   retention, and the MCP health monitor.

pub mod background;
pub mod cancel;
pub mod executor;
pub mod hooks;
pub mod ingress;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod session;
pub mod summary;
pub mod warnings;
pub mod worker;

pub use cancel::CancellationTracker;
pub use executor::ChainExecutor;
pub use ingress::AlertService;
pub use registry::{AgentRegistry, ChainRegistry};
pub use runner::SessionRunner;
pub use session::SessionService;
pub use warnings::SystemWarnings;
pub use worker::WorkerPool;
