use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{ReverbError, Result};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 admission signer for restricted channels.
///
/// Private channels sign `"{socket_id}:{channel}"`; presence channels sign
/// `"{socket_id}:{channel}:{channel_data}"` where `channel_data` is the
/// compact JSON of the caller's user data. The signed string must be
/// byte-identical to what goes on the wire, so the JSON is never
/// re-normalized between signing and sending.
#[derive(Debug, Clone)]
pub struct Authenticator {
    app_key: String,
    app_secret: String,
}

impl Authenticator {
    pub fn new(app_key: &str, app_secret: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
        }
    }

    /// Admission token for a private channel: `"{app_key}:{hex_hmac}"`.
    pub fn sign_private(&self, socket_id: &str, channel: &str) -> Result<String> {
        self.sign(&format!("{socket_id}:{channel}"))
    }

    /// Admission token and `channel_data` string for a presence channel.
    pub fn sign_presence(
        &self,
        socket_id: &str,
        channel: &str,
        user_data: &Value,
    ) -> Result<(String, String)> {
        let channel_data = serde_json::to_string(user_data)?;
        let auth = self.sign(&format!("{socket_id}:{channel}:{channel_data}"))?;
        Ok((auth, channel_data))
    }

    fn sign(&self, message: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.app_secret.as_bytes())
            .map_err(|_| ReverbError::Authentication("HMAC key setup failed".into()))?;
        mac.update(message.as_bytes());
        let digest = mac.finalize().into_bytes();
        Ok(format!("{}:{}", self.app_key, hex::encode(digest)))
    }
}
