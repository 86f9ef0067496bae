//! Weft Engine
//!
//! Wires the scheduler, executor and workers together in one process over a
//! shared queue, and gives callers a way to deploy flows and start, kill,
//! pause and observe executions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │  - deploy_str / deploy_dir → FlowRepository                 │
//! │  - submit / kill / pause / resume → Topic::Executor         │
//! │  - start(cancel) runs the configured roles                  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌────────────────┐  ┌───────────────────┐  ┌────────────────┐
//! │   Scheduler    │  │     Executor      │  │   Worker × N   │
//! │ triggers, cron │─▶│ execution state   │─▶│ plugin runs,   │
//! │ dedup windows  │  │ machine, outbox   │◀─│ heartbeats     │
//! └────────────────┘  └───────────────────┘  └────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut registry = PluginRegistry::new();
//! weft_core_plugins::register_all(&mut registry)?;
//!
//! let engine = Arc::new(Engine::builder(EngineConfig::default(), registry).build().await?);
//! engine.deploy_str(include_str!("hello.yaml")).await?;
//!
//! let cancel = CancellationToken::new();
//! tokio::spawn(engine.clone().start(cancel.clone()));
//!
//! let id = engine.submit("demo", "hello", Map::new()).await?;
//! let execution = engine.wait_for(&id, Duration::from_secs(60)).await?;
//! ```

mod config;
mod engine;
mod error;

pub use config::{EngineConfig, Role, StorageConfig};
pub use engine::{Engine, EngineBuilder, UPDATES_GROUP};
pub use error::EngineError;
