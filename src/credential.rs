//! Managed identity token acquisition.
//!
//! Tokens for `https://storage.azure.com/` are requested from the
//! platform's identity endpoint and nowhere else:
//!   - App Service / Functions / Container Apps: `IDENTITY_ENDPOINT` plus
//!     the `IDENTITY_HEADER` secret injected by the platform.
//!   - Everything else (VMs, AKS, scale sets): the Instance Metadata
//!     Service at `169.254.169.254`.
//!
//! There is no fallback to connection strings, account keys, SAS tokens
//! or developer logins.  Tokens are cached and refreshed five minutes
//! before they expire.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// OAuth resource for Azure Storage.
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

/// Default IMDS token endpoint.
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";

const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Refresh tokens this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 300;

/// A bearer token and its expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    /// True while the token is usable at `now` with the refresh margin.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - Duration::seconds(REFRESH_MARGIN_SECS) > now
    }
}

/// Where tokens come from.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentitySource {
    /// App Service style endpoint with its secret header.
    AppService { endpoint: String, header: String },
    /// Instance Metadata Service.
    Imds { endpoint: String },
}

impl IdentitySource {
    /// Pick the source from the values of `IDENTITY_ENDPOINT` and
    /// `IDENTITY_HEADER`.
    pub fn detect(identity_endpoint: Option<String>, identity_header: Option<String>) -> Self {
        match (identity_endpoint, identity_header) {
            (Some(endpoint), Some(header)) if !endpoint.is_empty() && !header.is_empty() => {
                IdentitySource::AppService { endpoint, header }
            }
            _ => IdentitySource::Imds {
                endpoint: IMDS_ENDPOINT.to_string(),
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            IdentitySource::AppService { .. } => "app-service",
            IdentitySource::Imds { .. } => "imds",
        }
    }
}

/// Token endpoint response.  Both endpoints send `expires_on` as epoch
/// seconds, some versions as a string and some as a number.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_on: EpochSeconds,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EpochSeconds {
    Number(i64),
    Text(String),
}

impl EpochSeconds {
    fn to_datetime(&self) -> anyhow::Result<DateTime<Utc>> {
        let secs = match self {
            EpochSeconds::Number(n) => *n,
            EpochSeconds::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| anyhow::anyhow!("invalid expires_on '{}': {}", s, e))?,
        };
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("expires_on out of range: {}", secs))
    }
}

fn parse_token_response(body: &str) -> anyhow::Result<AccessToken> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| anyhow::anyhow!("Malformed managed identity token response: {}", e))?;
    Ok(AccessToken {
        token: parsed.access_token,
        expires_on: parsed.expires_on.to_datetime()?,
    })
}

/// Managed identity credential with a token cache.
pub struct ManagedIdentityCredential {
    client: reqwest::Client,
    source: IdentitySource,
    client_id: Option<String>,
    cached: RwLock<Option<AccessToken>>,
}

impl ManagedIdentityCredential {
    /// Build a credential from the process environment.
    pub fn from_env(client_id: Option<String>) -> anyhow::Result<Self> {
        let source = IdentitySource::detect(
            std::env::var("IDENTITY_ENDPOINT").ok(),
            std::env::var("IDENTITY_HEADER").ok(),
        );
        Self::with_source(source, client_id)
    }

    /// Build a credential against an explicit token source.
    pub fn with_source(source: IdentitySource, client_id: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        info!(
            "Managed identity credential configured: source={} user_assigned={}",
            source.name(),
            client_id.is_some()
        );

        Ok(Self {
            client,
            source,
            client_id,
            cached: RwLock::new(None),
        })
    }

    /// Return a valid bearer token, fetching a new one when the cached
    /// token is missing or about to expire.
    pub async fn get_token(&self) -> anyhow::Result<AccessToken> {
        if let Some(token) = self.cached.read().await.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }

        let mut slot = self.cached.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(token) = slot.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }

        let token = self.fetch_token().await?;
        debug!("Managed identity token acquired, expires {}", token.expires_on);
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn fetch_token(&self) -> anyhow::Result<AccessToken> {
        let mut query: Vec<(&str, &str)> = vec![("resource", STORAGE_RESOURCE)];
        if let Some(id) = &self.client_id {
            query.push(("client_id", id.as_str()));
        }

        let req = match &self.source {
            IdentitySource::AppService { endpoint, header } => {
                query.push(("api-version", APP_SERVICE_API_VERSION));
                self.client
                    .get(endpoint)
                    .query(&query)
                    .header("X-IDENTITY-HEADER", header)
            }
            IdentitySource::Imds { endpoint } => {
                query.push(("api-version", IMDS_API_VERSION));
                self.client
                    .get(endpoint)
                    .query(&query)
                    .header("Metadata", "true")
            }
        };

        let resp = req.send().await.map_err(|e| {
            anyhow::anyhow!(
                "Managed identity endpoint ({}) unreachable: {}",
                self.source.name(),
                e
            )
        })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "Managed identity token request failed: HTTP {} - {}",
                status,
                body
            ));
        }

        parse_token_response(&body)
    }
}
