//! Durable side of the control loop: the append-only SQLite audit log, its
//! JSONL export, and configuration/topology file loading.

pub mod config;
pub mod error;
pub mod export;
pub mod schema;
pub mod store;

pub use config::{default_data_dir, load_config, load_topology, parse_config};
pub use error::{Result, StoreError};
pub use export::read_jsonl;
pub use store::{AuditQuery, AuditStore, RunSummary};
