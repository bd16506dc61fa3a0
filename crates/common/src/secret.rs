//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. Tenant secrets, server secrets and
//! the global HMAC key all travel through the balancer as `SecretString`, so
//! any struct that derives `Debug` on top of them logs `[REDACTED]` instead
//! of the value. Access requires an explicit `expose_secret()` call.
//!
//! Secrets are zeroized on drop.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("bbb-shared-secret");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("bbb-shared-secret"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("s3cret");
        assert_eq!(secret.expose_secret(), "s3cret");
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct TenantCredentials {
            realm: String,
            secret: SecretString,
        }

        let creds = TenantCredentials {
            realm: "bbb.example.com".to_string(),
            secret: SecretString::from("super-secret"),
        };

        let debug_str = format!("{creds:?}");

        assert!(debug_str.contains("bbb.example.com"));
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("super-secret"));
    }
}
