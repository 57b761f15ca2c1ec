//! Session controller for embedding third-party analytics reports.
//!
//! The [`coordinator`] drives one embed cycle at a time through token
//! acquisition, URL validation, configuration and render, while the leaf
//! modules (token cache, URL checks, retry policy, debug log) stay free of
//! coordinator state.

pub mod adapter;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod debug_log;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod phase;
pub mod retry;
pub mod telemetry;
pub mod token;
pub mod url_check;

pub use coordinator::{CoordinatorHandle, CoordinatorParts, SessionCoordinator};
pub use descriptor::DashboardDescriptor;
pub use error::{EmbedError, ErrorKind};
pub use phase::Phase;
