//! Traversal server descriptors and the cached credential lookup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LinkError;

/// Credentials are refetched this long before the issuer says they expire.
pub const CACHE_SAFETY_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

/// Response body of the credential endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

/// Public STUN plus the open relay project's TURN endpoints.
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
        IceServer::turn(
            "turn:openrelay.metered.ca:80",
            "openrelayproject",
            "openrelayproject",
        ),
        IceServer::turn(
            "turn:openrelay.metered.ca:443",
            "openrelayproject",
            "openrelayproject",
        ),
        IceServer::turn(
            "turn:openrelay.metered.ca:443?transport=tcp",
            "openrelayproject",
            "openrelayproject",
        ),
    ]
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<CredentialBundle, LinkError>;
}

pub struct HttpCredentialSource {
    client: Client,
    url: String,
}

impl HttpCredentialSource {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, LinkError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<CredentialBundle, LinkError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LinkError::Signaling(format!(
                "credential endpoint returned {status}"
            )));
        }
        let bundle = response
            .json::<CredentialBundle>()
            .await
            .map_err(|err| LinkError::Malformed(err.to_string()))?;
        Ok(bundle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    Fetched,
    Cached,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServers {
    pub servers: Vec<IceServer>,
    pub origin: CredentialOrigin,
}

struct CachedBundle {
    servers: Vec<IceServer>,
    expires_at: Instant,
}

/// Caches fetched credentials until `ttl - CACHE_SAFETY_MARGIN` and falls back
/// to a static list whenever the source fails. Never returns an error.
pub struct CredentialProvider {
    source: Option<Arc<dyn CredentialSource>>,
    fallback: Vec<IceServer>,
    cached: Option<CachedBundle>,
}

impl CredentialProvider {
    pub fn new(source: Arc<dyn CredentialSource>, fallback: Vec<IceServer>) -> Self {
        Self {
            source: Some(source),
            fallback,
            cached: None,
        }
    }

    pub fn fallback_only(fallback: Vec<IceServer>) -> Self {
        Self {
            source: None,
            fallback,
            cached: None,
        }
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub async fn ice_servers(&mut self) -> ResolvedServers {
        let now = Instant::now();
        if let Some(cached) = &self.cached {
            if now < cached.expires_at {
                return ResolvedServers {
                    servers: cached.servers.clone(),
                    origin: CredentialOrigin::Cached,
                };
            }
            self.cached = None;
        }

        let Some(source) = &self.source else {
            return self.fallback();
        };

        match source.fetch().await {
            Ok(bundle) if !bundle.ice_servers.is_empty() => {
                let lifetime = Duration::from_secs(bundle.ttl).saturating_sub(CACHE_SAFETY_MARGIN);
                if !lifetime.is_zero() {
                    self.cached = Some(CachedBundle {
                        servers: bundle.ice_servers.clone(),
                        expires_at: now + lifetime,
                    });
                }
                debug!(
                    target = "jam_link::credentials",
                    servers = bundle.ice_servers.len(),
                    ttl = bundle.ttl,
                    "fetched traversal credentials"
                );
                ResolvedServers {
                    servers: bundle.ice_servers,
                    origin: CredentialOrigin::Fetched,
                }
            }
            Ok(_) => {
                warn!(
                    target = "jam_link::credentials",
                    "credential endpoint returned no servers; using fallback"
                );
                self.fallback()
            }
            Err(err) => {
                warn!(
                    target = "jam_link::credentials",
                    error = %err,
                    "credential fetch failed; using fallback"
                );
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> ResolvedServers {
        ResolvedServers {
            servers: self.fallback.clone(),
            origin: CredentialOrigin::Fallback,
        }
    }
}
