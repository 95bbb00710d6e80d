use thiserror::Error;

/// Errors raised by the configuration and proxy layers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad bind specification {0:?}")]
    BadBind(String),

    #[error("bad custom backend format: {0}")]
    BadCustomBackend(String),

    #[error("invalid annotation value: {0}")]
    InvalidAnnotation(String),

    #[error("invalid TLS key pair: {0}")]
    InvalidCertificate(String),
}
