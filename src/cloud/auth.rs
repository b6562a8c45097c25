// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Three-stage authentication against the vendor serverless gateway.
//!
//! 1. *Anonymous token* — grants access to the gateway itself (~10 min).
//! 2. *Login* — exchanges email/password for a near-permanent user token.
//! 3. *MQTT token* — a JWT whose `exp` claim bounds the MQTT session.
//!
//! Every request is signed: the body fields are rendered as `key=value`
//! pairs, keys sorted ascending, empty values dropped, joined by `&`,
//! and the HMAC-MD5 hex digest under the fixed client secret goes into
//! the `x-serverless-sign` header.
//!
//! Each stage consults the [`TokenCache`] first. A restart that finds
//! the login and MQTT tokens cached performs no network I/O at all.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use md5::Md5;
use serde_json::{Value, json};

use crate::cache::{TokenCache, TokenStage, email_hash, now_unix};
use crate::config::mask_email;
use crate::error::{AuthError, Error, NetworkError};

/// Vendor serverless gateway endpoint.
const API_ENDPOINT: &str = "https://api.next.bspapp.com/client";
/// Fixed client secret the app build signs with.
const CLIENT_SECRET: &str = "5rCEdl/nx7IgViBe4QYRiQ==";
/// Serverless space the vendor functions live in.
const SPACE_ID: &str = "mp-6c382a98-49b8-40ba-b761-645d83e8ee74";
/// App identifier reported in `clientInfo`.
const APP_ID: &str = "__UNI__55F5E7F";
/// Signature header name.
const SIGN_HEADER: &str = "x-serverless-sign";
/// Token-endpoint request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
/// Fallback lifetime for the anonymous token when the gateway omits one.
const ANONYMOUS_TOKEN_TTL: u64 = 600;
/// The login token is effectively permanent; cache it far in the future.
const LOGIN_TOKEN_TTL: u64 = 14 * 365 * 86_400;

type HmacMd5 = Hmac<Md5>;

/// A token pair sufficient to open an MQTT session.
#[derive(Debug, Clone)]
pub struct TokenSet {
    /// Stage-2 login token and its expiry.
    pub login: CachedTokenPair,
    /// Stage-3 MQTT JWT and its expiry.
    pub mqtt: CachedTokenPair,
}

/// A token value with its absolute expiry.
#[derive(Debug, Clone)]
pub struct CachedTokenPair {
    /// The opaque token.
    pub token: String,
    /// Seconds since the Unix epoch.
    pub expires_at: u64,
}

impl TokenSet {
    /// Whether both tokens outlive `now`. The warm-reconnect
    /// precondition.
    #[must_use]
    pub fn valid_at(&self, now: u64) -> bool {
        self.login.expires_at > now && self.mqtt.expires_at > now
    }
}

/// Driver for the three-stage pipeline of one account.
#[derive(Debug)]
pub struct AuthPipeline {
    http: reqwest::Client,
    cache: TokenCache,
    email: String,
    password: String,
    endpoint: String,
}

impl AuthPipeline {
    /// Builds the pipeline with a 15 s request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] when the HTTP client cannot be
    /// constructed.
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        cache: TokenCache,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Fatal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            cache,
            email: email.into(),
            password: password.into(),
            endpoint: API_ENDPOINT.to_string(),
        })
    }

    /// Points the pipeline at a different gateway endpoint. Used by
    /// tests against a mock server.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// The account email this pipeline authenticates.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Produces a valid [`TokenSet`], running only the stages whose
    /// cached tokens are missing or inside the safety margin.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when a stage is rejected and
    /// [`NetworkError`] on transient failures.
    pub async fn ensure_tokens(&self) -> Result<TokenSet, Error> {
        let cached_login = self.cache.get(&self.email, TokenStage::Login);
        let cached_mqtt = self.cache.get(&self.email, TokenStage::Mqtt);

        if let (Some(login), Some(mqtt)) = (&cached_login, &cached_mqtt) {
            tracing::debug!(account = %mask_email(&self.email), "All tokens cached, skipping authentication");
            return Ok(TokenSet {
                login: pair(login),
                mqtt: pair(mqtt),
            });
        }

        let login = match cached_login {
            Some(entry) => pair(&entry),
            None => self.fetch_login_token().await?,
        };
        let mqtt = match cached_mqtt {
            Some(entry) => pair(&entry),
            None => self.fetch_mqtt_token(&login.token).await?,
        };
        Ok(TokenSet { login, mqtt })
    }

    /// Drops every cached stage for this account.
    pub fn invalidate(&self) {
        tracing::info!(account = %mask_email(&self.email), "Invalidating cached tokens");
        self.cache.invalidate(&self.email);
    }

    /// Stage 1: anonymous gateway token, cached briefly to accelerate
    /// restarts.
    async fn anonymous_token(&self) -> Result<String, Error> {
        if let Some(entry) = self.cache.get(&self.email, TokenStage::Anonymous) {
            return Ok(entry.token);
        }

        let response = self
            .call("serverless.auth.user.anonymousAuthorize", "{}", None)
            .await
            .map_err(|e| stage_context(e, "anonymous authorization"))?;
        let token = response
            .pointer("/data/accessToken")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingToken {
                stage: "anonymous authorization",
            })?
            .to_string();
        let ttl = response
            .pointer("/data/expiresInSecond")
            .and_then(Value::as_u64)
            .unwrap_or(ANONYMOUS_TOKEN_TTL);

        let expires_at = now_unix() + ttl;
        self.store(TokenStage::Anonymous, &token, expires_at);
        tracing::debug!(account = %mask_email(&self.email), ttl, "Anonymous token acquired");
        Ok(token)
    }

    /// Stage 2: user login.
    async fn fetch_login_token(&self) -> Result<CachedTokenPair, Error> {
        let data = json!({
            "locale": "en",
            "email": self.email,
            "password": self.password,
        });
        let response = self
            .invoke("user/pub/login", data, None)
            .await
            .map_err(|e| stage_context(e, "login"))?;
        let token = response
            .pointer("/data/token")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingToken { stage: "login" })?
            .to_string();

        let expires_at = now_unix() + LOGIN_TOKEN_TTL;
        self.store(TokenStage::Login, &token, expires_at);
        tracing::info!(account = %mask_email(&self.email), "Login token acquired");
        Ok(CachedTokenPair { token, expires_at })
    }

    /// Stage 3: MQTT JWT; the expiry is its `exp` claim.
    async fn fetch_mqtt_token(&self, login_token: &str) -> Result<CachedTokenPair, Error> {
        let response = self
            .invoke("common/emqx.getAccessToken", json!({}), Some(login_token))
            .await
            .map_err(|e| stage_context(e, "MQTT token"))?;
        let token = response
            .pointer("/data/access_token")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingToken { stage: "MQTT token" })?
            .to_string();

        let expires_at = jwt_expiry(&token).map_err(Error::Auth)?;
        self.store(TokenStage::Mqtt, &token, expires_at);
        tracing::info!(
            account = %mask_email(&self.email),
            expires_at,
            "MQTT token acquired"
        );
        Ok(CachedTokenPair { token, expires_at })
    }

    /// Invokes a vendor cloud function through the gateway router.
    pub(crate) async fn invoke(
        &self,
        url: &str,
        data: Value,
        uni_id_token: Option<&str>,
    ) -> Result<Value, Error> {
        let anonymous = self.anonymous_token().await?;
        let mut args = json!({
            "$url": url,
            "data": data,
            "clientInfo": {
                "PLATFORM": "app",
                "OS": "android",
                "APPID": APP_ID,
                "DEVICEID": self.device_id(),
            },
        });
        if let Some(token) = uni_id_token {
            args["uniIdToken"] = Value::String(token.to_string());
        }
        let params = json!({
            "functionTarget": "router",
            "functionArgs": args,
        })
        .to_string();
        self.call("serverless.function.runtime.invoke", &params, Some(&anonymous))
            .await
    }

    /// One signed POST to the gateway.
    async fn call(
        &self,
        method: &str,
        params: &str,
        token: Option<&str>,
    ) -> Result<Value, Error> {
        let timestamp = now_millis();
        let mut fields = vec![
            ("method", method.to_string()),
            ("params", params.to_string()),
            ("spaceId", SPACE_ID.to_string()),
            ("timestamp", timestamp.to_string()),
        ];
        if let Some(token) = token {
            fields.push(("token", token.to_string()));
        }
        let signature = sign_fields(&fields);

        let mut body = json!({
            "method": method,
            "params": params,
            "spaceId": SPACE_ID,
            "timestamp": timestamp,
        });
        if let Some(token) = token {
            body["token"] = Value::String(token.to_string());
        }

        let response = self
            .http
            .post(&self.endpoint)
            .header(SIGN_HEADER, signature)
            .json(&body)
            .send()
            .await
            .map_err(NetworkError::Http)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Auth(AuthError::StageRejected {
                stage: "gateway",
                reason: format!("HTTP {status}"),
            }));
        }
        let response = response.error_for_status().map_err(NetworkError::Http)?;
        let value: Value = response.json().await.map_err(NetworkError::Http)?;

        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let reason = value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified gateway error")
                .to_string();
            return Err(Error::Auth(AuthError::StageRejected {
                stage: "gateway",
                reason,
            }));
        }
        Ok(value)
    }

    fn store(&self, stage: TokenStage, token: &str, expires_at: u64) {
        if let Err(error) = self.cache.put(&self.email, stage, token, expires_at) {
            tracing::warn!(stage = stage.as_str(), %error, "Cannot persist token");
        }
    }

    /// Stable pseudo device id derived from the account.
    fn device_id(&self) -> String {
        email_hash(&self.email)[..16].to_string()
    }
}

fn pair(entry: &crate::cache::CachedToken) -> CachedTokenPair {
    CachedTokenPair {
        token: entry.token.clone(),
        expires_at: entry.expires_at,
    }
}

/// Attaches the stage name to gateway-level rejections.
fn stage_context(error: Error, stage: &'static str) -> Error {
    match error {
        Error::Auth(AuthError::StageRejected { reason, .. }) => {
            Error::Auth(AuthError::StageRejected { stage, reason })
        }
        other => other,
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Signs `key=value` pairs, keys sorted ascending, empty values dropped.
fn sign_fields(fields: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> =
        fields.iter().filter(|(_, value)| !value.is_empty()).collect();
    sorted.sort_by_key(|(key, _)| *key);
    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut mac = HmacMd5::new_from_slice(CLIENT_SECRET.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(joined.as_bytes());
    hex(&mac.finalize().into_bytes())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Extracts the `exp` claim from an unverified JWT.
pub(crate) fn jwt_expiry(token: &str) -> Result<u64, AuthError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::BadJwt("not a three-part JWT".to_string()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::BadJwt(format!("payload is not base64url: {e}")))?;
    let claims: Value = serde_json::from_slice(&decoded)
        .map_err(|e| AuthError::BadJwt(format!("payload is not JSON: {e}")))?;
    claims
        .get("exp")
        .and_then(Value::as_u64)
        .ok_or_else(|| AuthError::BadJwt("missing exp claim".to_string()))
}
