pub mod context;
pub mod covariant_group;
pub mod errors;
pub mod records;
pub mod snapshot;
pub mod status;
pub mod tunable;
pub mod tunable_groups;

pub use context::*;
pub use covariant_group::*;
pub use errors::*;
pub use records::*;
pub use snapshot::*;
pub use status::*;
pub use tunable::*;
pub use tunable_groups::*;
