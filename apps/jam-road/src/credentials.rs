//! Short-lived TURN credentials in the TURN REST format: the username is the
//! expiry time plus a tag, the password an HMAC of it under the secret the
//! TURN server shares with us.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use jam_link::credentials::{CredentialBundle, IceServer};
use sha1::Sha1;

use crate::config::Config;

type HmacSha1 = Hmac<Sha1>;

const USERNAME_TAG: &str = "jam";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid TURN secret")]
    InvalidSecret,
}

#[derive(Debug, Clone)]
struct TurnRelay {
    host: String,
    secret: String,
}

#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    stun_urls: Vec<String>,
    turn: Option<TurnRelay>,
    ttl_seconds: u64,
}

impl CredentialIssuer {
    pub fn new(
        stun_urls: Vec<String>,
        turn_host: Option<String>,
        turn_secret: Option<String>,
        ttl_seconds: u64,
    ) -> Self {
        let turn = match (turn_host, turn_secret) {
            (Some(host), Some(secret)) => Some(TurnRelay { host, secret }),
            _ => None,
        };
        Self {
            stun_urls,
            turn,
            ttl_seconds,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.stun_urls.clone(),
            config.turn_host.clone(),
            config.turn_secret.clone(),
            config.credential_ttl_seconds,
        )
    }

    pub fn has_turn(&self) -> bool {
        self.turn.is_some()
    }

    /// Servers valid from `now_unix` for the configured TTL.
    pub fn issue(&self, now_unix: u64) -> Result<CredentialBundle, CredentialError> {
        let mut ice_servers: Vec<IceServer> =
            self.stun_urls.iter().map(IceServer::stun).collect();

        if let Some(turn) = &self.turn {
            let username = format!(
                "{}:{USERNAME_TAG}",
                now_unix.saturating_add(self.ttl_seconds)
            );
            let password = turn_password(&turn.secret, &username)?;
            for url in [
                format!("turn:{}:3478", turn.host),
                format!("turn:{}:5349?transport=tcp", turn.host),
            ] {
                ice_servers.push(IceServer::turn(url, username.clone(), password.clone()));
            }
        }

        Ok(CredentialBundle {
            ice_servers,
            ttl: self.ttl_seconds,
        })
    }
}

/// `base64(HMAC-SHA1(secret, username))`.
pub fn turn_password(secret: &str, username: &str) -> Result<String, CredentialError> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|_| CredentialError::InvalidSecret)?;
    mac.update(username.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn password_matches_known_hmac() {
        assert_eq!(
            turn_password("key", "The quick brown fox jumps over the lazy dog").unwrap(),
            "3nybhbi3iqa8ino29wqQcBydtNk="
        );
    }

    #[test_timeout::timeout]
    fn issues_turn_entries_after_stun() {
        let issuer = CredentialIssuer::new(
            vec!["stun:stun.example.org:3478".into()],
            Some("turn.example.org".into()),
            Some("road-secret".into()),
            3600,
        );
        let bundle = issuer.issue(1_700_000_000).unwrap();

        assert_eq!(bundle.ttl, 3600);
        let urls: Vec<&str> = bundle
            .ice_servers
            .iter()
            .map(|server| server.urls[0].as_str())
            .collect();
        assert_eq!(
            urls,
            [
                "stun:stun.example.org:3478",
                "turn:turn.example.org:3478",
                "turn:turn.example.org:5349?transport=tcp",
            ]
        );
        let turn = &bundle.ice_servers[1];
        assert_eq!(turn.username.as_deref(), Some("1700003600:jam"));
        assert_eq!(
            turn.credential.as_deref(),
            Some("YGS64e1WKNRgOLFMMKccQKjnoLM=")
        );
    }

    #[test_timeout::timeout]
    fn without_secret_only_stun_is_offered() {
        let issuer = CredentialIssuer::new(
            vec!["stun:a:1".into(), "stun:b:2".into()],
            Some("turn.example.org".into()),
            None,
            600,
        );
        assert!(!issuer.has_turn());
        let bundle = issuer.issue(0).unwrap();
        assert_eq!(bundle.ice_servers.len(), 2);
        assert!(bundle
            .ice_servers
            .iter()
            .all(|server| server.username.is_none()));
    }
}
