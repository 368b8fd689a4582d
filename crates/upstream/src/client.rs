//! Upstream client factory and the vault session lifecycle
//! (logon → work → logoff).

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use vp_domain::instance::CyberArkInstance;
use vp_domain::snapshot::{
    UpstreamAuthorizationRecord, UpstreamMembershipRecord, UpstreamUserRecord,
};

use crate::error::{UpstreamError, UpstreamResult};
use crate::trust::TrustStore;
use crate::types::{GroupsResponse, SafesResponse, UpstreamPage, UsersResponse};

/// Longest upstream error body kept in messages.
const MAX_ERROR_BODY: usize = 512;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ClientFactory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds HTTP clients against the current trust snapshot. Each build picks
/// up the latest snapshot, so a trust refresh reaches the next client
/// without restarting anything.
pub struct ClientFactory {
    trust: Arc<TrustStore>,
    timeout: Duration,
}

impl ClientFactory {
    pub fn new(trust: Arc<TrustStore>, timeout: Duration) -> Self {
        Self { trust, timeout }
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Build a raw HTTP client with the current trust snapshot installed.
    pub fn http_client(&self, skip_tls_verify: bool) -> UpstreamResult<reqwest::Client> {
        let snapshot = self.trust.snapshot();
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(self.timeout);
        for certificate in &snapshot.certificates {
            builder = builder.add_root_certificate(certificate.clone());
        }
        if skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder
            .build()
            .map_err(|e| UpstreamError::Transport(format!("building client: {e}")))
    }

    /// A vault client for one configured instance. `password` is the
    /// already-decrypted upstream credential.
    pub fn client_for_instance(
        &self,
        instance: &CyberArkInstance,
        password: String,
    ) -> UpstreamResult<CyberArkClient> {
        let http = self.http_client(instance.skip_tls_verify)?;
        Ok(CyberArkClient {
            http,
            base_url: instance.base_url.trim_end_matches('/').to_string(),
            username: instance.username.clone(),
            password,
            concurrent_sessions: instance.concurrent_sessions,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CyberArkClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CyberArkClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    concurrent_sessions: bool,
}

impl CyberArkClient {
    /// Authenticate and open a session. The returned session owns the token
    /// and must be logged off when done.
    pub async fn logon(&self) -> UpstreamResult<VaultSession> {
        let url = format!("{}/PasswordVault/API/auth/Cyberark/Logon", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "username": self.username,
                "password": self.password,
                "concurrentSession": self.concurrent_sessions,
            }))
            .send()
            .await?;
        let response = check_status(response).await?;
        // The vault answers with the bare token as a JSON string.
        let token: String = response
            .json()
            .await
            .map_err(|e| UpstreamError::Transport(format!("reading logon token: {e}")))?;
        Ok(VaultSession {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token,
        })
    }

    /// Authenticate, measure latency, and log off again.
    pub async fn test_connection(&self) -> UpstreamResult<u64> {
        let started = Instant::now();
        let session = self.logon().await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        session.logoff().await?;
        Ok(latency_ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// VaultSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An authenticated session against one vault.
#[derive(Debug)]
pub struct VaultSession {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl VaultSession {
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> UpstreamResult<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header("Authorization", &self.token)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| UpstreamError::Other {
                status: 200,
                message: format!("malformed upstream response: {e}"),
            })
    }

    async fn send_checked(&self, request: reqwest::RequestBuilder) -> UpstreamResult<reqwest::Response> {
        let response = request.header("Authorization", &self.token).send().await?;
        check_status(response).await
    }

    // ── Inventory listings ──────────────────────────────────────────

    pub async fn list_users(
        &self,
        page_offset: u64,
        page_size: u32,
    ) -> UpstreamResult<UpstreamPage<UpstreamUserRecord>> {
        let resp: UsersResponse = self
            .get_json(&format!(
                "/PasswordVault/API/Users?pageOffset={page_offset}&pageSize={page_size}"
            ))
            .await?;
        let consumed = resp.users.len() as u64;
        Ok(UpstreamPage {
            items: resp.users.into_iter().map(Into::into).collect(),
            consumed,
            total: resp.total,
        })
    }

    pub async fn list_safe_authorizations(
        &self,
        offset: u64,
        limit: u32,
    ) -> UpstreamResult<UpstreamPage<UpstreamAuthorizationRecord>> {
        let resp: SafesResponse = self
            .get_json(&format!(
                "/PasswordVault/API/Safes?includeMembers=true&offset={offset}&limit={limit}"
            ))
            .await?;
        let total = resp.count;
        let consumed = resp.value.len() as u64;
        Ok(UpstreamPage {
            items: resp
                .value
                .into_iter()
                .flat_map(|safe| safe.into_authorizations())
                .collect(),
            consumed,
            total,
        })
    }

    pub async fn list_group_memberships(
        &self,
        offset: u64,
        limit: u32,
    ) -> UpstreamResult<UpstreamPage<UpstreamMembershipRecord>> {
        let resp: GroupsResponse = self
            .get_json(&format!(
                "/PasswordVault/API/UserGroups?include=members&offset={offset}&limit={limit}"
            ))
            .await?;
        let total = resp.count;
        let consumed = resp.value.len() as u64;
        Ok(UpstreamPage {
            items: resp
                .value
                .into_iter()
                .flat_map(|group| group.into_memberships())
                .collect(),
            consumed,
            total,
        })
    }

    // ── Safe administration ─────────────────────────────────────────

    pub async fn get_safe(&self, safe_name: &str) -> UpstreamResult<serde_json::Value> {
        self.get_json(&format!("/PasswordVault/API/Safes/{safe_name}"))
            .await
    }

    pub async fn create_safe(&self, body: &serde_json::Value) -> UpstreamResult<serde_json::Value> {
        let response = self
            .send_checked(
                self.http
                    .post(format!("{}/PasswordVault/API/Safes", self.base_url))
                    .json(body),
            )
            .await?;
        response.json().await.map_err(|e| UpstreamError::Other {
            status: 200,
            message: format!("malformed upstream response: {e}"),
        })
    }

    pub async fn update_safe(
        &self,
        safe_name: &str,
        body: &serde_json::Value,
    ) -> UpstreamResult<serde_json::Value> {
        let response = self
            .send_checked(
                self.http
                    .put(format!(
                        "{}/PasswordVault/API/Safes/{safe_name}",
                        self.base_url
                    ))
                    .json(body),
            )
            .await?;
        response.json().await.map_err(|e| UpstreamError::Other {
            status: 200,
            message: format!("malformed upstream response: {e}"),
        })
    }

    pub async fn delete_safe(&self, safe_name: &str) -> UpstreamResult<()> {
        self.send_checked(self.http.delete(format!(
            "{}/PasswordVault/API/Safes/{safe_name}",
            self.base_url
        )))
        .await?;
        Ok(())
    }

    pub async fn add_safe_member(
        &self,
        safe_name: &str,
        body: &serde_json::Value,
    ) -> UpstreamResult<serde_json::Value> {
        let response = self
            .send_checked(
                self.http
                    .post(format!(
                        "{}/PasswordVault/API/Safes/{safe_name}/Members",
                        self.base_url
                    ))
                    .json(body),
            )
            .await?;
        response.json().await.map_err(|e| UpstreamError::Other {
            status: 200,
            message: format!("malformed upstream response: {e}"),
        })
    }

    pub async fn remove_safe_member(
        &self,
        safe_name: &str,
        member_name: &str,
    ) -> UpstreamResult<()> {
        self.send_checked(self.http.delete(format!(
            "{}/PasswordVault/API/Safes/{safe_name}/Members/{member_name}",
            self.base_url
        )))
        .await?;
        Ok(())
    }

    /// Close the session. Consumes the session so a token is never reused
    /// after logoff.
    pub async fn logoff(self) -> UpstreamResult<()> {
        let response = self
            .http
            .post(format!("{}/PasswordVault/API/auth/Logoff", self.base_url))
            .header("Authorization", &self.token)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> UpstreamResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    body.truncate(MAX_ERROR_BODY);
    Err(UpstreamError::from_status(status.as_u16(), body))
}
