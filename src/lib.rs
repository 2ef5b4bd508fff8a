//! DStore remote agent: a mirrored element store with miners behind a
//! command dispatcher, a multiplexed command channel and client services.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod miners;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod services;
pub mod store;
pub mod utils;

pub use config::Config;
pub use context::DStoreContext;
pub use error::{DStoreError, Result};
pub use services::ClientConnection;
pub use store::{DataStore, Element, ElementId, ElementValue, StatusState};
