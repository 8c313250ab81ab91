use thiserror::Error;

/// Main error type for the TuneBench system
#[derive(Error, Debug)]
pub enum TbError {
    #[error("Tunable error: {0}")]
    Tunable(#[from] TunableError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Service failure: {message}")]
    ServiceFailure { message: String },

    #[error("Provisioning of {target} timed out after {timeout_seconds} seconds")]
    ProvisionTimeout { target: String, timeout_seconds: u64 },

    #[error("Environment composition error: {0}")]
    Composition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the tunable parameter model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TunableError {
    #[error("Value {value} is out of domain {domain} for tunable {name}")]
    OutOfDomain {
        name: String,
        value: String,
        domain: String,
    },

    #[error("Unknown tunable: {name}")]
    UnknownTunable { name: String },

    #[error("Unknown covariant group: {name}")]
    UnknownGroup { name: String },

    #[error("Duplicate tunable name: {name}")]
    DuplicateTunable { name: String },

    #[error("Invalid tunable definition {name}: {message}")]
    InvalidTunable { name: String, message: String },

    #[error("Type mismatch for tunable {name}: expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

/// Storage consistency and backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Schema mismatch for experiment {experiment_id}: stored {stored}, requested {requested}")]
    SchemaMismatch {
        experiment_id: String,
        stored: String,
        requested: String,
    },

    #[error("Trial {experiment_id}:{trial_id} already finalized as {status}, cannot set {requested}")]
    AlreadyFinalized {
        experiment_id: String,
        trial_id: i64,
        status: String,
        requested: String,
    },

    #[error("Experiment not found: {experiment_id}")]
    ExperimentNotFound { experiment_id: String },

    #[error("Trial not found: {experiment_id}:{trial_id}")]
    TrialNotFound { experiment_id: String, trial_id: i64 },

    #[error("Tunable config not found: {config_id}")]
    ConfigNotFound { config_id: i64 },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Migration from schema version {from} failed: {message}")]
    Migration { from: i64, message: String },

    #[error("Stored record is corrupt: {message}")]
    Corruption { message: String },
}

/// Result type alias for TuneBench operations
pub type TbResult<T> = Result<T, TbError>;

impl TbError {
    /// Errors that must stop a whole run instead of being localized to one trial.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TbError::Storage(StorageError::SchemaMismatch { .. })
                | TbError::Storage(StorageError::AlreadyFinalized { .. })
                | TbError::Storage(StorageError::Migration { .. })
                | TbError::Storage(StorageError::Corruption { .. })
                | TbError::Composition(_)
                | TbError::Config(_)
        )
    }
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TbError::Config(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TbError::Internal(format!($($arg)*))
    };
}

/// Macro for creating environment composition errors
#[macro_export]
macro_rules! composition_error {
    ($($arg:tt)*) => {
        $crate::TbError::Composition(format!($($arg)*))
    };
}
