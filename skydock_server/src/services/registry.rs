//! Container-registry verification against the OCI Distribution v2 API.
//!
//! The deploy stage refuses to roll out an image nobody pushed, so before
//! any deploy we confirm the manifest exists. Private registries answer the
//! anonymous GET with 401 and a Bearer challenge; we complete the token
//! dance with the registry credentials and retry once.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::Duration;

use crate::error::{AppError, AppResult};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a `WWW-Authenticate: Bearer realm="…",service="…",scope="…"` header.
/// Parameters split on commas outside quotes; a scope like
/// `repository:a/b:pull,push` is one value.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in split_unquoted_commas(rest) {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

fn split_unquoted_commas(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Token endpoint URL for a parsed challenge.
pub fn token_url(challenge: &BearerChallenge) -> String {
    let mut url = challenge.realm.clone();
    let mut sep = '?';
    if let Some(service) = &challenge.service {
        url.push(sep);
        url.push_str("service=");
        url.push_str(service);
        sep = '&';
    }
    if let Some(scope) = &challenge.scope {
        url.push(sep);
        url.push_str("scope=");
        url.push_str(scope);
    }
    url
}

#[derive(Clone)]
pub struct RegistryVerifier {
    http: reqwest::Client,
    access_key: String,
    secret_key: String,
}

impl RegistryVerifier {
    pub fn new(access_key: String, secret_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            access_key,
            secret_key,
        }
    }

    /// One manifest existence check. `registry` is a bare hostname,
    /// `image` the repository path, `tag` the reference.
    pub async fn manifest_exists(
        &self,
        registry: &str,
        image: &str,
        tag: &str,
    ) -> AppResult<bool> {
        let url = format!("https://{registry}/v2/{image}/manifests/{tag}");
        let response = self
            .http
            .get(&url)
            .header("Accept", MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| AppError::ExternalApi {
                provider: "registry",
                status: 0,
                body: e.to_string(),
            })?;

        match response.status().as_u16() {
            200 => Ok(true),
            401 => {
                let challenge = response
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_bearer_challenge);
                let Some(challenge) = challenge else {
                    return Ok(false);
                };
                let token = self.fetch_token(&challenge).await?;
                let retry = self
                    .http
                    .get(&url)
                    .header("Accept", MANIFEST_ACCEPT)
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|e| AppError::ExternalApi {
                        provider: "registry",
                        status: 0,
                        body: e.to_string(),
                    })?;
                Ok(retry.status().is_success())
            }
            status => {
                tracing::debug!(registry, image, tag, status, "manifest check negative");
                Ok(false)
            }
        }
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> AppResult<String> {
        let basic = BASE64.encode(format!("{}:{}", self.access_key, self.secret_key));
        let response = self
            .http
            .get(token_url(challenge))
            .header("Authorization", format!("Basic {basic}"))
            .send()
            .await
            .map_err(|e| AppError::ExternalApi {
                provider: "registry",
                status: 0,
                body: e.to_string(),
            })?;
        let status = response.status().as_u16();
        let body: serde_json::Value =
            response.json().await.map_err(|e| AppError::ExternalApi {
                provider: "registry",
                status,
                body: e.to_string(),
            })?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or(AppError::ExternalApi {
                provider: "registry",
                status,
                body: "token missing from auth response".to_string(),
            })
    }

    /// Pushed images become visible with a short lag after a build, so the
    /// gate retries with a linearly growing delay before concluding absence.
    pub async fn verify_with_backoff(
        &self,
        registry: &str,
        image: &str,
        tag: &str,
    ) -> AppResult<bool> {
        const ATTEMPTS: u64 = 5;
        for attempt in 1..=ATTEMPTS {
            match self.manifest_exists(registry, image, tag).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "registry check errored");
                }
            }
            if attempt < ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(2 * attempt)).await;
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry",scope="repository:app/web:pull""#;
        let challenge = parse_bearer_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service.as_deref(), Some("registry"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:app/web:pull"));
    }

    #[test]
    fn parses_realm_only_challenge() {
        let challenge = parse_bearer_challenge(r#"Bearer realm="https://r/token""#).unwrap();
        assert_eq!(challenge.realm, "https://r/token");
        assert!(challenge.service.is_none());
        assert!(challenge.scope.is_none());
    }

    #[test]
    fn scope_with_comma_stays_one_value() {
        let header = r#"Bearer realm="https://r/token",service="registry",scope="repository:app/web:pull,push""#;
        let challenge = parse_bearer_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://r/token");
        assert_eq!(challenge.scope.as_deref(), Some("repository:app/web:pull,push"));
    }

    #[test]
    fn rejects_non_bearer_schemes() {
        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
        assert!(parse_bearer_challenge("Bearer service=\"no-realm\"").is_none());
    }

    #[test]
    fn token_url_appends_parameters_in_order() {
        let challenge = BearerChallenge {
            realm: "https://r/token".to_string(),
            service: Some("svc".to_string()),
            scope: Some("repository:a/b:pull".to_string()),
        };
        assert_eq!(
            token_url(&challenge),
            "https://r/token?service=svc&scope=repository:a/b:pull"
        );
        let bare = BearerChallenge {
            realm: "https://r/token".to_string(),
            service: None,
            scope: None,
        };
        assert_eq!(token_url(&bare), "https://r/token");
    }
}
