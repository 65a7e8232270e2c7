use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::ConfigError;

/// Encode string to base64 (for obfuscation, NOT security)
pub fn encode(plain: &str) -> String {
    STANDARD.encode(plain.as_bytes())
}

/// Decode base64 string
pub fn decode(encoded: &str) -> Result<String, ConfigError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ConfigError::DecodeError(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ConfigError::DecodeError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_obfuscation() {
        let encoded = encode("s3cr:t@pass");
        assert_ne!(encoded, "s3cr:t@pass");
        assert_eq!(decode(&encoded).unwrap(), "s3cr:t@pass");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("***"), Err(ConfigError::DecodeError(_))));
    }
}
