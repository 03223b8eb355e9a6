//! Authentication header construction.
//!
//! Four schemes are supported: HTTP Basic, static token, and the two OAuth2
//! flows (client credentials and a generic grant type with a refresh
//! token). OAuth2 access tokens are cached in the shared Redis, encrypted
//! with the process-wide [`TokenCipher`], so any instance in the fleet can
//! reuse a token another instance obtained.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

use crate::crypto::TokenCipher;
use crate::error::{DispatcherError, DispatcherResult};
use crate::protocol::Namespace;
use crate::request::now_millis;
use crate::transport::Transport;

/// Tokens within this window of their nominal expiry are treated as
/// already expired.
const EXPIRY_SLACK: Duration = Duration::from_secs(5 * 60);

const FIELD_ACCESS_TOKEN: &str = "accessToken";
const FIELD_REFRESH_TOKEN: &str = "refreshToken";
const FIELD_EXPIRES_AT: &str = "expiresAt";

/// Where the refresh request carries its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthDataLocation {
    JsonBody,
    UrlQuery,
    UrlEncodedForm,
}

/// Shared settings for both OAuth2 flows.
#[derive(Clone)]
pub struct OAuth2Options {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
    pub data_location: OAuthDataLocation,
    /// Extra refresh parameters. Values may reference `{{clientId}}`,
    /// `{{clientSecret}}` and `{{refreshToken}}`.
    pub data_template: HashMap<String, String>,
    /// Send client id/secret as HTTP Basic on the refresh call instead of
    /// in the parameters.
    pub use_basic_auth: bool,
    pub header_name: Option<String>,
    pub prefix: Option<String>,
    pub exclude_prefix: bool,
}

impl OAuth2Options {
    pub fn new(token_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_token: None,
            data_location: OAuthDataLocation::UrlEncodedForm,
            data_template: HashMap::new(),
            use_basic_auth: false,
            header_name: None,
            prefix: None,
            exclude_prefix: false,
        }
    }
}

/// Authentication scheme attached to a client.
#[derive(Clone)]
pub enum Authentication {
    Basic {
        username: String,
        password: String,
        header_name: Option<String>,
        prefix: Option<String>,
        exclude_prefix: bool,
    },
    Token {
        token: String,
        base64_encode: bool,
        header_name: Option<String>,
        prefix: Option<String>,
        exclude_prefix: bool,
    },
    OAuth2ClientCredentials(OAuth2Options),
    OAuth2GrantType(OAuth2Options),
}

impl Authentication {
    pub fn basic(username: &str, password: &str) -> Self {
        Authentication::Basic {
            username: username.to_string(),
            password: password.to_string(),
            header_name: None,
            prefix: None,
            exclude_prefix: false,
        }
    }

    pub fn token(token: &str) -> Self {
        Authentication::Token {
            token: token.to_string(),
            base64_encode: false,
            header_name: None,
            prefix: None,
            exclude_prefix: false,
        }
    }
}

/// Builds `{header: "<prefix> <value>"}` pairs for outgoing requests and
/// owns the encrypted token cache.
pub struct Authenticator {
    transport: Arc<dyn Transport>,
    cipher: TokenCipher,
    namespace: Namespace,
    http: reqwest::Client,
}

impl Authenticator {
    pub fn new(transport: Arc<dyn Transport>, cipher: TokenCipher, namespace: Namespace) -> Self {
        Self {
            transport,
            cipher,
            namespace,
            http: reqwest::Client::new(),
        }
    }

    /// Resolves the auth header for one request on `client_name`.
    pub async fn header_for(
        &self,
        client_name: &str,
        auth: &Authentication,
    ) -> DispatcherResult<(String, String)> {
        match auth {
            Authentication::Basic {
                username,
                password,
                header_name,
                prefix,
                exclude_prefix,
            } => {
                let value = BASE64.encode(format!("{}:{}", username, password));
                Ok(render_header(
                    header_name,
                    prefix.as_deref().unwrap_or("Basic"),
                    *exclude_prefix,
                    &value,
                ))
            }
            Authentication::Token {
                token,
                base64_encode,
                header_name,
                prefix,
                exclude_prefix,
            } => {
                let value = if *base64_encode {
                    BASE64.encode(token)
                } else {
                    token.clone()
                };
                Ok(render_header(
                    header_name,
                    prefix.as_deref().unwrap_or("Bearer"),
                    *exclude_prefix,
                    &value,
                ))
            }
            Authentication::OAuth2ClientCredentials(options) => {
                let token = self
                    .oauth2_token(client_name, options, "client_credentials")
                    .await?;
                Ok(render_header(
                    &options.header_name,
                    options.prefix.as_deref().unwrap_or("Bearer"),
                    options.exclude_prefix,
                    &token,
                ))
            }
            Authentication::OAuth2GrantType(options) => {
                let token = self
                    .oauth2_token(client_name, options, "refresh_token")
                    .await?;
                Ok(render_header(
                    &options.header_name,
                    options.prefix.as_deref().unwrap_or("Bearer"),
                    options.exclude_prefix,
                    &token,
                ))
            }
        }
    }

    /// Returns a valid access token, refreshing through the token endpoint
    /// when the cache misses or the cached token is near expiry.
    async fn oauth2_token(
        &self,
        client_name: &str,
        options: &OAuth2Options,
        grant_type: &str,
    ) -> DispatcherResult<String> {
        let cache_key = self.namespace.oauth_key(client_name);
        let cached = self.transport.hash_get_all(&cache_key).await?;

        if let Some(token) = self.usable_cached_token(&cached)? {
            debug!(client = client_name, "using cached OAuth2 token");
            return Ok(token);
        }

        // Prefer a previously stored refresh token over the configured one.
        let refresh_token = match cached.get(FIELD_REFRESH_TOKEN) {
            Some(stored) => Some(self.cipher.decrypt(stored)?),
            None => options.refresh_token.clone(),
        };

        let grant = self
            .request_token(options, grant_type, refresh_token.as_deref())
            .await?;
        info!(client = client_name, "refreshed OAuth2 token");

        let expires_at = now_millis() + grant.expires_in_ms;
        let mut fields = vec![
            (
                FIELD_ACCESS_TOKEN.to_string(),
                self.cipher.encrypt(&grant.access_token)?,
            ),
            (FIELD_EXPIRES_AT.to_string(), expires_at.to_string()),
        ];
        if let Some(refresh) = &grant.refresh_token {
            fields.push((
                FIELD_REFRESH_TOKEN.to_string(),
                self.cipher.encrypt(refresh)?,
            ));
        }
        self.transport.hash_set(&cache_key, &fields).await?;
        self.transport
            .expire(&cache_key, Duration::from_millis(grant.expires_in_ms))
            .await?;

        Ok(grant.access_token)
    }

    fn usable_cached_token(
        &self,
        cached: &HashMap<String, String>,
    ) -> DispatcherResult<Option<String>> {
        let (Some(stored), Some(expires_at)) =
            (cached.get(FIELD_ACCESS_TOKEN), cached.get(FIELD_EXPIRES_AT))
        else {
            return Ok(None);
        };
        let Ok(expires_at) = expires_at.parse::<u64>() else {
            return Ok(None);
        };
        if now_millis() + EXPIRY_SLACK.as_millis() as u64 >= expires_at {
            return Ok(None);
        }
        Ok(Some(self.cipher.decrypt(stored)?))
    }

    async fn request_token(
        &self,
        options: &OAuth2Options,
        grant_type: &str,
        refresh_token: Option<&str>,
    ) -> DispatcherResult<TokenGrant> {
        let params = refresh_params(options, grant_type, refresh_token);

        let mut request = self.http.post(&options.token_url);
        if options.use_basic_auth {
            request = request.basic_auth(&options.client_id, Some(&options.client_secret));
        }
        request = match options.data_location {
            OAuthDataLocation::JsonBody => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                request.json(&body)
            }
            OAuthDataLocation::UrlQuery => request.query(&params),
            OAuthDataLocation::UrlEncodedForm => request.form(&params),
        };

        let response = request
            .send()
            .await
            .map_err(|e| DispatcherError::AuthRefresh(e.to_string()))?;
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DispatcherError::AuthRefresh(e.to_string()))?;

        if !status.is_success() {
            return Err(DispatcherError::AuthRefresh(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DispatcherError::AuthRefresh("token response missing access_token".to_string())
            })?
            .to_string();
        let expires_in_ms = body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .map(|secs| secs * 1000)
            .unwrap_or_else(|| Duration::from_secs(3600).as_millis() as u64);
        let refresh_token = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(TokenGrant {
            access_token,
            expires_in_ms,
            refresh_token,
        })
    }
}

struct TokenGrant {
    access_token: String,
    expires_in_ms: u64,
    refresh_token: Option<String>,
}

fn render_header(
    header_name: &Option<String>,
    prefix: &str,
    exclude_prefix: bool,
    value: &str,
) -> (String, String) {
    let name = header_name
        .clone()
        .unwrap_or_else(|| "Authorization".to_string());
    let value = if exclude_prefix {
        value.to_string()
    } else {
        format!("{} {}", prefix, value)
    };
    (name, value)
}

/// Parameters sent to the token endpoint, built from the template if one is
/// configured and the conventional fields otherwise.
fn refresh_params(
    options: &OAuth2Options,
    grant_type: &str,
    refresh_token: Option<&str>,
) -> Vec<(String, String)> {
    if !options.data_template.is_empty() {
        let mut params: Vec<(String, String)> = options
            .data_template
            .iter()
            .map(|(key, value)| {
                let rendered = value
                    .replace("{{clientId}}", &options.client_id)
                    .replace("{{clientSecret}}", &options.client_secret)
                    .replace("{{refreshToken}}", refresh_token.unwrap_or_default());
                (key.clone(), rendered)
            })
            .collect();
        params.sort();
        return params;
    }

    let mut params = vec![("grant_type".to_string(), grant_type.to_string())];
    if !options.use_basic_auth {
        params.push(("client_id".to_string(), options.client_id.clone()));
        params.push(("client_secret".to_string(), options.client_secret.clone()));
    }
    if let Some(refresh) = refresh_token {
        params.push(("refresh_token".to_string(), refresh.to_string()));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryHub;

    fn authenticator(hub: &MemoryHub) -> Authenticator {
        Authenticator::new(
            hub.transport(),
            TokenCipher::new("test-key").unwrap(),
            Namespace::new(None),
        )
    }

    #[tokio::test]
    async fn basic_auth_encodes_credentials() {
        let hub = MemoryHub::new();
        let auth = authenticator(&hub);
        let (name, value) = auth
            .header_for("svc", &Authentication::basic("user", "pass"))
            .await
            .unwrap();
        assert_eq!(name, "Authorization");
        assert_eq!(value, format!("Basic {}", BASE64.encode("user:pass")));
    }

    #[tokio::test]
    async fn token_auth_defaults_to_bearer() {
        let hub = MemoryHub::new();
        let auth = authenticator(&hub);
        let (_, value) = auth
            .header_for("svc", &Authentication::token("abc"))
            .await
            .unwrap();
        assert_eq!(value, "Bearer abc");
    }

    #[tokio::test]
    async fn token_auth_can_drop_prefix_and_encode() {
        let hub = MemoryHub::new();
        let auth = authenticator(&hub);
        let scheme = Authentication::Token {
            token: "abc".to_string(),
            base64_encode: true,
            header_name: Some("X-Api-Key".to_string()),
            prefix: None,
            exclude_prefix: true,
        };
        let (name, value) = auth.header_for("svc", &scheme).await.unwrap();
        assert_eq!(name, "X-Api-Key");
        assert_eq!(value, BASE64.encode("abc"));
    }

    #[tokio::test]
    async fn cached_oauth_token_is_reused_without_refresh() {
        let hub = MemoryHub::new();
        let auth = authenticator(&hub);
        let cipher = TokenCipher::new("test-key").unwrap();

        // Seed the cache the way another instance would have.
        let key = Namespace::new(None).oauth_key("svc");
        let far_future = now_millis() + 3_600_000;
        hub.transport()
            .hash_set(
                &key,
                &[
                    (
                        FIELD_ACCESS_TOKEN.to_string(),
                        cipher.encrypt("cached-token").unwrap(),
                    ),
                    (FIELD_EXPIRES_AT.to_string(), far_future.to_string()),
                ],
            )
            .await
            .unwrap();

        let scheme = Authentication::OAuth2ClientCredentials(OAuth2Options::new(
            "http://127.0.0.1:1/token",
            "id",
            "secret",
        ));
        let (_, value) = auth.header_for("svc", &scheme).await.unwrap();
        assert_eq!(value, "Bearer cached-token");
    }

    #[tokio::test]
    async fn near_expiry_tokens_are_not_reused() {
        let hub = MemoryHub::new();
        let auth = authenticator(&hub);
        let cipher = TokenCipher::new("test-key").unwrap();

        let cached = HashMap::from([
            (
                FIELD_ACCESS_TOKEN.to_string(),
                cipher.encrypt("stale").unwrap(),
            ),
            // Expires within the slack window.
            (
                FIELD_EXPIRES_AT.to_string(),
                (now_millis() + 60_000).to_string(),
            ),
        ]);
        assert!(auth.usable_cached_token(&cached).unwrap().is_none());
    }

    #[test]
    fn default_refresh_params_follow_the_grant() {
        let options = OAuth2Options::new("http://token", "id", "secret");
        let params = refresh_params(&options, "client_credentials", None);
        assert!(params.contains(&("grant_type".to_string(), "client_credentials".to_string())));
        assert!(params.contains(&("client_id".to_string(), "id".to_string())));

        let params = refresh_params(&options, "refresh_token", Some("r-1"));
        assert!(params.contains(&("refresh_token".to_string(), "r-1".to_string())));
    }

    #[test]
    fn basic_auth_refresh_omits_inline_credentials() {
        let mut options = OAuth2Options::new("http://token", "id", "secret");
        options.use_basic_auth = true;
        let params = refresh_params(&options, "client_credentials", None);
        assert!(!params.iter().any(|(k, _)| k == "client_id"));
    }

    #[test]
    fn template_placeholders_are_substituted() {
        let mut options = OAuth2Options::new("http://token", "the-id", "the-secret");
        options.data_template = HashMap::from([
            ("cid".to_string(), "{{clientId}}".to_string()),
            ("sec".to_string(), "{{clientSecret}}".to_string()),
            ("rt".to_string(), "{{refreshToken}}".to_string()),
        ]);
        let params = refresh_params(&options, "refresh_token", Some("r-9"));
        assert!(params.contains(&("cid".to_string(), "the-id".to_string())));
        assert!(params.contains(&("sec".to_string(), "the-secret".to_string())));
        assert!(params.contains(&("rt".to_string(), "r-9".to_string())));
    }
}
