//! Shared error types for the paper mirror

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Serialization failed: {message}")]
    SerializationError { message: String },

    #[error("Deserialization failed: {message}")]
    DeserializationError { message: String },

    #[error("Invalid configuration: {field} = {value}: {reason}")]
    InvalidConfig { field: String, value: String, reason: String },
}

pub type SharedResult<T> = Result<T, SharedError>;
