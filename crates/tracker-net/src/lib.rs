//! Tracker networking
//!
//! This crate provides the request/response plumbing shared by the tracker
//! and its clients:
//! - [`server::NetServer`]: multi-address accept loops and connection reading
//! - [`dispatcher`]: packet type to handler routing onto the worker pool
//! - [`pool::WorkerPool`]: bounded handler execution with backpressure
//! - [`client::NetClient`]: multiplexed `send_sync` over one connection
//! - [`scheduler::TaskScheduler`]: deferred and periodic background tasks

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod pool;
pub mod scheduler;
pub mod server;

pub use client::NetClient;
pub use connection::ConnectionHandle;
pub use dispatcher::{Dispatcher, HandlerRegistry, PacketHandler, Reply, RequestContext};
pub use pool::{PoolStats, WorkerPool};
pub use scheduler::TaskScheduler;
pub use server::NetServer;
