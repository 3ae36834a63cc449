//! TLS settings for sessions created with `ssl = true`.
//!
//! Without a CA path the platform's native root store is used. With one, the
//! broker certificate is verified against that CA only, and a client
//! certificate/key pair enables mutual TLS.

use std::{fs, path::Path};

use rumqttc::{TlsConfiguration, Transport};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::RumqttError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsSettings {
    /// Path to the CA certificate (PEM) used to verify the broker.
    ///
    /// # Examples
    /// ```toml
    /// ca_cert_path = "/etc/ssl/certs/ca-bundle.crt"
    /// ```
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    /// Client certificate (PEM) for mutual TLS. Requires `client_key_path`.
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    /// Unencrypted client private key (PEM). Requires `client_cert_path`.
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsSettings {
    pub fn with_ca(ca_cert_path: impl Into<String>) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            ..Default::default()
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Loads the configured files and builds the rumqttc transport.
    ///
    /// # Errors
    /// - `RumqttError::Tls`: only one of client certificate/key is set, or
    ///   client auth is configured without a CA
    /// - `RumqttError::Io`: a file cannot be read
    pub fn build_transport(&self) -> Result<Transport, RumqttError> {
        let client_auth = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
            (None, None) => None,
            _ => {
                return Err(RumqttError::Tls(
                    "client certificate and key must be configured together".into(),
                ))
            }
        };

        match &self.ca_cert_path {
            Some(ca_path) => Ok(Transport::Tls(TlsConfiguration::Simple {
                ca: fs::read(ca_path)?,
                alpn: None,
                client_auth,
            })),
            None if client_auth.is_some() => Err(RumqttError::Tls(
                "client authentication requires a CA certificate".into(),
            )),
            None => Ok(Transport::tls_with_default_config()),
        }
    }
}

fn validate_optional_file_exists(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::new("empty_path").with_message("File path cannot be empty".into()));
    }

    let path_obj = Path::new(path);
    if !path_obj.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn pem(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn test_default_settings() {
        let settings = TlsSettings::default();
        assert!(settings.validate().is_ok());
        assert!(!settings.has_client_auth());
    }

    #[test]
    fn test_ca_and_client_auth_are_loaded() {
        let ca = pem(b"ca");
        let cert = pem(b"cert");
        let key = pem(b"key");
        let settings = TlsSettings {
            ca_cert_path: Some(ca.path().to_string_lossy().into_owned()),
            client_cert_path: Some(cert.path().to_string_lossy().into_owned()),
            client_key_path: Some(key.path().to_string_lossy().into_owned()),
        };

        assert!(settings.validate().is_ok());
        match settings.build_transport() {
            Ok(Transport::Tls(TlsConfiguration::Simple { ca, client_auth, .. })) => {
                assert_eq!(ca, b"ca");
                assert_eq!(client_auth, Some((b"cert".to_vec(), b"key".to_vec())));
            }
            _ => panic!("expected a CA-pinned TLS transport"),
        }
    }

    #[test]
    fn test_half_configured_client_auth_is_rejected() {
        let cert = pem(b"cert");
        let settings = TlsSettings {
            client_cert_path: Some(cert.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert!(matches!(settings.build_transport(), Err(RumqttError::Tls(_))));
    }

    #[test]
    fn test_missing_file() {
        let settings = TlsSettings::with_ca("/nonexistent/ca.pem");
        assert!(settings.validate().is_err());
        assert!(matches!(settings.build_transport(), Err(RumqttError::Io(_))));
    }
}
