//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Listener strategy (address, unix path, fd, custom)
//!     → listener.rs (bound std socket → tokio listener, accept)
//!     → tls.rs (optional TLS handshake material)
//!     → connection.rs (lifecycle tracking, idle activity)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Sockets bound at configuration time are kept as std sockets until served
//! - Each connection tracked so a timed-out drain can report what it cut off
//! - TLS is optional and handled per connection after accept

pub mod connection;
pub mod listener;
pub mod tls;

pub use listener::{normalize_addr, BoundListener};
