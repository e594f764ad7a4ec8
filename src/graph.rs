use anyhow::{Context, Result};

pub const DEFAULT_PHOTO_URL: &str = "https://graph.microsoft.com/v1.0/me/photos/48x48/$value";

/// Fetches the signed-in user's profile picture with a broker-issued token.
#[derive(Clone)]
pub struct PhotoClient {
    http: reqwest::Client,
    url: String,
}

impl PhotoClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// `Ok(None)` when Graph answers but has no usable picture.
    pub async fn fetch(&self, access_token: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .bearer_auth(access_token)
            .send()
            .await
            .with_context(|| format!("profile photo request to {} failed", self.url))?;

        if !response.status().is_success() {
            tracing::debug!(
                target = "sso_bridge::graph",
                status = %response.status(),
                "profile photo unavailable"
            );
            return Ok(None);
        }

        let bytes = response
            .bytes()
            .await
            .context("failed reading profile photo body")?;
        Ok(Some(bytes.to_vec()))
    }
}
