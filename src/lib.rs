//! Tessera - an out-of-process compositor server
//!
//! Tessera owns the compositor and exposes it to several client processes
//! at once over a local socket. Requests and responses travel over the
//! socket; per-session render state, the active-session view and device
//! and timing snapshots are shared through one memory-mapped segment.
//!
//! # Architecture
//!
//! - **Server Core**: calloop accept loop, session arena, active-session arbitration
//! - **Sessions**: one thread per connection with a blocking dispatch loop
//! - **Shared Memory**: fixed layout, single writer per area, publish-then-read ring slots
//! - **Compositor**: capability traits plus a headless implementation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera::compositor::HeadlessCompositor;
//! use tessera::config::ServerConfig;
//! use tessera::server::Server;
//!
//! let server = Server::start(ServerConfig::default(), Arc::new(HeadlessCompositor::new()))?;
//! server.run()?;
//! # Ok::<(), tessera::error::StartupError>(())
//! ```

pub mod compositor;
pub mod config;
pub mod device;
pub mod error;
pub mod ipc;
pub mod server;
pub mod session;
pub mod shm;
pub mod timing;
