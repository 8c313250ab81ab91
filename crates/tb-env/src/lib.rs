//! Benchmark environments for TuneBench.
//!
//! An [`Environment`] is a state machine driven through setup, run and
//! teardown. Concrete environments talk to their targets only through the
//! capabilities of a [`tb_services::Services`] bundle.

pub mod builder;
pub mod composite;
pub mod environment;
pub mod local;
pub mod mock;
pub mod remote;

pub use builder::EnvSpec;
pub use composite::CompositeEnv;
pub use environment::*;
pub use local::{LocalEnv, LocalEnvOptions};
pub use mock::{MockEnv, MockEnvOptions, MockProbe};
pub use remote::{FileMapping, RemoteEnv, RemoteEnvOptions};
