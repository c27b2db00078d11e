//! Run coordination for Baton workers.
//!
//! A run executes on exactly one instance: [`lock`] gates it, [`control`]
//! listens for stop requests, [`relay`] streams engine output into the
//! response log through [`pending`], and [`finalizer`] releases everything and
//! records the outcome through [`status`].

pub mod config;
pub mod control;
pub mod engine;
pub mod finalizer;
pub mod health;
pub mod lock;
pub mod pending;
pub mod reader;
pub mod relay;
pub mod runner;
pub mod status;
pub mod worker;

pub use config::WorkerConfig;
pub use control::{ControlListener, ListenerHandle, ListenerSettings, ListenerState};
pub use engine::{EventStream, ExecutionEngine, ScriptStep, ScriptedEngine};
pub use finalizer::{release_run_resources, CleanupStep, FinalizeReport, RunFinalizer};
pub use health::{check_health, health_key, HEALTHY};
pub use lock::RunLockManager;
pub use pending::{DrainOutcome, WriteQueue, WriterStats};
pub use reader::{ReadError, RunReader};
pub use relay::{RelayOutcome, ResponseCounter, ResponseRelay};
pub use runner::{RunError, RunExecutor, RunReport};
pub use status::StatusUpdater;
pub use worker::{QueueError, RunCompletion, Worker, WorkerHandle};
