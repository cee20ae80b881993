use thiserror::Error;

/// Main error type for the trial runner
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Dataset ingestion and preparation errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data source not found: {0}")]
    SourceNotFound(String),

    #[error("Invalid data format: {message}")]
    InvalidFormat { message: String },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Data loading failed: {message}")]
    LoadingFailed { message: String },

    #[error("Data parsing error: {message}")]
    ParseError { message: String },
}

/// Worker cluster and client errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cluster startup failed: {message}")]
    StartupFailed { message: String },

    #[error("Cluster teardown failed: {message}")]
    TeardownFailed { message: String },

    #[error("Client is closed")]
    ClientClosed,

    #[error("Cluster {cluster_id} is closed")]
    ClusterClosed { cluster_id: String },

    #[error("Unknown worker: {worker}")]
    WorkerNotFound { worker: String },

    #[error("Worker {worker} stopped responding")]
    WorkerLost { worker: String },

    #[error("Block {key} not found on worker {worker}")]
    BlockNotFound { worker: String, key: String },

    #[error("Task failed on worker {worker}: {message}")]
    TaskFailed { worker: String, message: String },
}

/// Model training, inference and persistence errors
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Worker {worker} holds no training partition")]
    EmptyWorkerPartition { worker: String },

    #[error("Invalid label: {message}")]
    InvalidLabel { message: String },

    #[error("Invalid hyperparameter {parameter}: {message}")]
    InvalidParameter { parameter: String, message: String },

    #[error("Empty input: {message}")]
    EmptyInput { message: String },

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
}

/// Result type alias for trial operations
pub type TtResult<T> = Result<T, TrialError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TrialError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TrialError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ClusterError::BlockNotFound {
            worker: "worker-1".to_string(),
            key: "abc".to_string(),
        };

        assert!(error.to_string().contains("worker-1"));
        assert!(error.to_string().contains("abc"));
    }

    #[test]
    fn test_error_conversion() {
        let model_error = ModelError::EmptyWorkerPartition {
            worker: "worker-3".to_string(),
        };
        let err: TrialError = model_error.into();

        match err {
            TrialError::Model(ModelError::EmptyWorkerPartition { .. }) => (),
            _ => panic!("Expected Model error"),
        }
    }

    #[test]
    fn test_macros() {
        let internal_err = internal_error!("Something went wrong");
        assert!(matches!(internal_err, TrialError::Internal(_)));
        let config_err = config_error!("Missing required field: {}", "label_column");
        assert_eq!(
            config_err.to_string(),
            "Configuration error: Missing required field: label_column"
        );
    }
}
