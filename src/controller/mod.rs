//! Connection controller.
//!
//! The consumer-facing surface of the crate. A controller ties one endpoint
//! to a state machine that opens, monitors and re-establishes a transport:
//!
//! ```text
//!                 ┌──────────────┐
//!   ┌────────────►│ disconnected │◄──────────── close() / clean close
//!   │             └──────┬───────┘
//!   │                    │ enabled + url + visible
//!   │                    ▼
//!   │             ┌──────────────┐   open    ┌───────────┐
//!   │             │  connecting  │──────────►│ connected │
//!   │             └──────────────┘           └─────┬─────┘
//!   │                    ▲                         │ abnormal close / error
//!   │                    │ retry timer             ▼ / pong timeout
//!   │                    │                 ┌──────────────┐
//!   │                    └─────────────────│ reconnecting │
//!   │                                      └──────┬───────┘
//!   │ reconnect()                                 │ budget exhausted
//!   │                                      ┌──────▼───────┐
//!   └──────────────────────────────────────│    error     │
//!                                          └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`ConnectionController`] handle |
//! | `builder` | [`ConnectionBuilder`] |
//! | `options` | [`ConnectionOptions`] and URL validation |
//! | `handlers` | Consumer callback types |
//! | `driver` | Event loop owning the state machine (internal) |

// ============================================================================
// Submodules
// ============================================================================

/// Controller builder.
pub mod builder;

/// Controller handle.
pub mod core;

/// Consumer callbacks.
pub mod handlers;

/// Serializable options.
pub mod options;

mod driver;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ConnectionBuilder;
pub use self::core::ConnectionController;
pub use handlers::{CloseHandler, ErrorHandler, Handlers, MessageHandler, OpenHandler};
pub use options::{ConnectionOptions, parse_url};
