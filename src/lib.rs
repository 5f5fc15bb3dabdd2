//! Diagram Workbench Server: a versioned document store (C1-C5) plus a
//! real-time collaboration hub (C6-C10) for multi-user diagram editing.
//! Each module below corresponds to one of the ten components.

pub mod auth;
pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod hub;
pub mod protected;
pub mod quota;
pub mod spec;
pub mod storage;
pub mod thumbnails;

pub use config::Config;
pub use hub::Hub;
pub use protected::{CircuitConfig, ProtectedStorage};
pub use storage::Storage;
