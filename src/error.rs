use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskGridError {
    #[error("Job doesn't belong to a registered dispatcher: {0}")]
    UnknownDispatcher(String),

    #[error("Endpoint not connected: {0}")]
    UnknownEndpoint(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Already disposed: {0}")]
    Disposed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TaskGridError> for tonic::Status {
    fn from(err: TaskGridError) -> Self {
        match err {
            TaskGridError::UnknownDispatcher(_) => {
                tonic::Status::failed_precondition(err.to_string())
            }
            TaskGridError::InvalidPayload(_) | TaskGridError::Serialization(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            TaskGridError::UnknownEndpoint(_) => tonic::Status::not_found(err.to_string()),
            TaskGridError::NotConnected(_) | TaskGridError::Disposed(_) => {
                tonic::Status::unavailable(err.to_string())
            }
            TaskGridError::Rpc(status) => status,
            TaskGridError::Transport(_) | TaskGridError::Io(_) => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskGridError>;
