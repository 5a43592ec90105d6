//! Custom validation functions for configuration.

use validator::ValidationError;

/// Length in bytes of the handshake-token key.
pub const SECRET_LEN: usize = 32;

/// Validate that a secret is exactly 32 hex-encoded bytes.
pub fn validate_secret(secret: &str) -> Result<(), ValidationError> {
    match hex::decode(secret) {
        Ok(bytes) if bytes.len() == SECRET_LEN => Ok(()),
        Ok(_) => Err(ValidationError::new("secret_length")),
        Err(_) => Err(ValidationError::new("secret_not_hex")),
    }
}

/// Validate that a log level is one `tracing` understands.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error", "off"]
        .contains(&level.to_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

/// Validate a `host:port` socket address.
pub fn validate_bind(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<std::net::SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_bind_address"))
}
