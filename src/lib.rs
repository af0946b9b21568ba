//! DCA Server - control plane for a fleet of datakit collector agents
//!
//! Remote collector agents ("datakits") dial in over long-lived WebSocket
//! connections; the server monitors, configures and operates them through a
//! correlated request/reply protocol, with dedicated secondary connections
//! for bulk streaming operations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 REST console                     │
//! │   list  │  actions  │  log tail  │  download     │
//! └───────────────────────┬──────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────┐
//! │             Connection Registry                   │
//! │   control task  │  live map  │  action routing   │
//! └───────────────────────┬──────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────┐
//! │      Agent connections (one per datakit)          │
//! │   read loop │ write loop │ pending correlations  │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod message;
pub mod registry;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DatakitRecord, DatakitRepo, DatakitStatus, DbConn, DbPool};
pub use error::{Error, Result};
pub use message::{DatakitDescriptor, Message, ResponseEnvelope};
pub use registry::{Client, ClientHandle, Registry, RegistrySettings};
