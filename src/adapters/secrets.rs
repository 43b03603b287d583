//! Secret fetching utilities for Kubernetes secrets

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::error::{not_found_as, Error, Result};
use crate::orchestrator::Credentials;

/// Secret key holding the S3 access key id
pub const ACCESS_KEY_ID_KEY: &str = "AccessKeyId";
/// Secret key holding the S3 secret access key
pub const SECRET_ACCESS_KEY_KEY: &str = "SecretAccessKey";
/// Secret key holding an optional session token
pub const SESSION_TOKEN_KEY: &str = "SessionToken";
/// Secret key holding an optional client-side encryption key
pub const ENCRYPTION_KEY_KEY: &str = "EncryptionKey";

/// Fetch a secret from Kubernetes
pub async fn get_secret(client: &Client, name: &str, namespace: &str) -> Result<Secret> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .get(name)
        .await
        .map_err(|e| not_found_as(e, || Error::SecretNotFound(format!("{}/{}", namespace, name))))
}

/// Get an optional string value from a secret
pub fn get_secret_string(secret: &Secret, key: &str) -> Result<Option<String>> {
    let Some(bytes) = secret.data.as_ref().and_then(|data| data.get(key)) else {
        return Ok(None);
    };

    String::from_utf8(bytes.0.clone())
        .map(Some)
        .map_err(|e| Error::config(format!("Invalid UTF-8 in secret key '{}': {}", key, e)))
}

/// Read storage credentials from a secret. Every key is optional.
pub fn credentials_from_secret(secret: &Secret) -> Result<Credentials> {
    Ok(Credentials {
        access_key_id: get_secret_string(secret, ACCESS_KEY_ID_KEY)?.unwrap_or_default(),
        secret_access_key: get_secret_string(secret, SECRET_ACCESS_KEY_KEY)?.unwrap_or_default(),
        session_token: get_secret_string(secret, SESSION_TOKEN_KEY)?.unwrap_or_default(),
        encryption_key: get_secret_string(secret, ENCRYPTION_KEY_KEY)?.filter(|k| !k.is_empty()),
    })
}
