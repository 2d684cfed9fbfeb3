//! Offline-first request handling: a TTL cache over durable key-value
//! storage, a persistent queue of writes made while offline, connectivity
//! tracking and the coordinator that reconciles everything on reconnect.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod network;
pub mod notify;
pub mod queue;
pub mod router;
pub mod storage;
pub mod views;

pub use config::Config;
pub use connectivity::{ConnectivityMonitor, PlatformSignal, ReachabilityProbe};
pub use coordinator::{CoordinatorOptions, SyncCoordinator};
pub use engine::{EngineOptions, Response, ResponseSource, SyncEngine};
pub use error::{Result, SyncError};
pub use network::{HttpNetwork, Method, Request};
pub use router::RouteTable;
