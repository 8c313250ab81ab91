//! Service capabilities for TuneBench environments.
//!
//! Environments never talk to a cloud API, SSH session or shell directly;
//! they go through the narrow capability traits defined here.

pub mod capabilities;
pub mod local;
pub mod mock;
pub mod retry;

pub use capabilities::*;
pub use local::{LocalExecService, LocalFileShare};
pub use mock::{MockHostConfig, MockHostService};
pub use retry::RetryPolicy;
