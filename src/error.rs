/// All errors that can occur in the nocturn library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Device not found: {name}")]
    DeviceNotFound { name: String },

    #[error("Device {name} is a {actual}, expected {expected}")]
    KindMismatch {
        name: String,
        expected: crate::drivers::DeviceKind,
        actual: crate::drivers::DeviceKind,
    },

    #[error("Property not found on {device}: {name}")]
    PropertyNotFound { device: String, name: String },

    #[error("A confirmation wait is already in flight")]
    ConfirmationInFlight,

    #[error("Duplicate driver executable in table: {exec}")]
    DuplicateDriver { exec: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Already closed")]
    Closed,
}

impl Error {
    /// Whether this error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
