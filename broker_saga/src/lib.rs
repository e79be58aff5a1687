#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

mod config;
mod engine;
mod errors;
mod events;
mod record;
mod runner;
mod step;
mod store;
mod supervisor;

pub use config::SagaConfig;
pub use engine::{SagaEngine, SagaResult};
pub use errors::{PersistenceError, SagaError};
pub use events::{SagaEvent, SagaEventKind, SagaEventListener, SagaMetrics, SagaTypeTotals, StepTotals};
pub use record::{SagaRecord, SagaState};
pub use runner::SagaRunner;
pub use step::SagaStep;
pub use store::{InMemorySagaStore, SagaStore};
pub use supervisor::{SagaCycleResult, SagaTimeoutSupervisor};
