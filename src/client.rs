//! Standalone HTTP client for the Tado API (the subset this daemon needs).
//!
//! - Blocking client using `ureq` (no async).
//! - Uses the models in `crate::models::tado`.
//!
//! Authentication
//! - Device-code OAuth2 grant against the Tado auth service: a persisted
//!   refresh token is exchanged at construction when available, otherwise a
//!   device authorization is started and [`TadoClient::device_activation`]
//!   polls until the user approves it.
//! - The refresh token is persisted to the configured token file on every
//!   grant; Tado rotates refresh tokens, so the file is rewritten after each
//!   refresh as well.

use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::models::tado::*;

const BASE_URL: &str = "https://my.tado.com/api/v2";
const AUTH_BASE_URL: &str = "https://login.tado.com/oauth2";
const OAUTH_CLIENT_ID: &str = "1bb50063-6b0c-4d11-bd99-387f4a91cc46";
const OAUTH_SCOPE: &str = "offline_access";
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Bearer tokens are refreshed this long before their reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum TadoApiError {
    /// Network-level failure; the request may not have reached the API.
    Transport(String),
    /// Non-auth HTTP error response.
    Http { status: u16, message: String },
    /// Response did not match the expected shape.
    Decode(String),
    /// The session's credentials were rejected; re-authorization is required.
    Credentials(String),
}

impl TadoApiError {
    pub fn is_credentials(&self) -> bool {
        matches!(self, TadoApiError::Credentials(_))
    }
}

impl core::fmt::Display for TadoApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TadoApiError::Transport(s) => write!(f, "transport error: {}", s),
            TadoApiError::Http { status, message } => write!(f, "http {}: {}", status, message),
            TadoApiError::Decode(s) => write!(f, "unexpected response shape: {}", s),
            TadoApiError::Credentials(s) => write!(f, "credentials error: {}", s),
        }
    }
}

impl std::error::Error for TadoApiError {}

/// Device-code authorization progress, mirrored from the auth service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActivationStatus {
    NotStarted,
    Pending,
    Completed,
}

#[derive(Debug, Clone)]
struct OAuthToken {
    access_token: String,
    expires_at: Instant,
    refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingActivation {
    device_code: String,
    user_code: String,
    verification_url: Option<String>,
    poll_interval: Duration,
    expires_at: Instant,
}

#[derive(Debug)]
struct AuthState {
    status: ActivationStatus,
    token: Option<OAuthToken>,
    pending: Option<PendingActivation>,
}

#[derive(Debug)]
pub struct TadoClient {
    agent: ureq::Agent,
    base_url: String,
    auth_base_url: String,
    token_file: PathBuf,
    auth: RefCell<AuthState>,
}

#[derive(serde::Deserialize)]
struct TokenGrant {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(serde::Deserialize)]
struct DeviceAuthorizeGrant {
    device_code: String,
    user_code: String,
    #[serde(default)]
    verification_uri: Option<String>,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(serde::Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl OAuthErrorBody {
    fn describe(&self) -> String {
        match self.error_description.as_deref() {
            Some(desc) if !desc.is_empty() => format!("{} ({})", self.error, desc),
            _ => self.error.clone(),
        }
    }
}

impl TadoClient {
    /// Construct against the production endpoints. A persisted refresh token
    /// short-circuits to `Completed`; otherwise a device authorization is
    /// started and the client comes up `Pending`.
    pub fn new(token_file: PathBuf) -> Result<Self, TadoApiError> {
        Self::with_urls(BASE_URL, AUTH_BASE_URL, token_file)
    }

    pub fn with_urls(
        base_url: impl Into<String>,
        auth_base_url: impl Into<String>,
        token_file: PathBuf,
    ) -> Result<Self, TadoApiError> {
        let client = TadoClient {
            agent: ureq::AgentBuilder::new().build(),
            base_url: base_url.into(),
            auth_base_url: auth_base_url.into(),
            token_file,
            auth: RefCell::new(AuthState {
                status: ActivationStatus::NotStarted,
                token: None,
                pending: None,
            }),
        };

        match client.load_persisted_refresh_token()? {
            Some(refresh) => {
                let grant = client.refresh_grant(&refresh)?;
                client.install_grant(grant);
            }
            None => client.begin_device_flow()?,
        }
        Ok(client)
    }

    pub fn activation_status(&self) -> ActivationStatus {
        self.auth.borrow().status
    }

    pub fn verification_url(&self) -> Option<String> {
        self.auth
            .borrow()
            .pending
            .as_ref()
            .and_then(|p| p.verification_url.clone())
    }

    pub fn user_code(&self) -> Option<String> {
        self.auth.borrow().pending.as_ref().map(|p| p.user_code.clone())
    }

    /// Poll the auth service until the pending device authorization is
    /// approved (`true`), or the code expires / is denied (`false`). Blocks
    /// for the full approval wait. Transport failures surface as errors.
    pub fn device_activation(&self) -> Result<bool, TadoApiError> {
        loop {
            let (device_code, poll_interval, expires_at) = {
                let s = self.auth.borrow();
                match &s.pending {
                    Some(p) => (p.device_code.clone(), p.poll_interval, p.expires_at),
                    None => {
                        return Err(TadoApiError::Credentials(
                            "no device authorization in progress".to_string(),
                        ));
                    }
                }
            };
            if Instant::now() >= expires_at {
                debug!("device code expired before approval");
                return Ok(false);
            }
            thread::sleep(poll_interval);

            let resp = self
                .agent
                .post(&format!("{}/token", self.auth_base_url))
                .set("Accept", "application/json")
                .send_form(&[
                    ("client_id", OAUTH_CLIENT_ID),
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("device_code", device_code.as_str()),
                ]);
            match resp {
                Ok(r) => {
                    let grant: TokenGrant = decode_json(r)?;
                    self.install_grant(grant);
                    return Ok(true);
                }
                Err(ureq::Error::Status(status, r)) => match oauth_error(r) {
                    Some(body) if body.error == "authorization_pending" => continue,
                    Some(body) if body.error == "slow_down" => {
                        let mut s = self.auth.borrow_mut();
                        if let Some(p) = s.pending.as_mut() {
                            p.poll_interval += Duration::from_secs(5);
                        }
                        continue;
                    }
                    Some(body) if body.error == "expired_token" || body.error == "access_denied" => {
                        debug!("device authorization ended without approval: {}", body.error);
                        return Ok(false);
                    }
                    Some(body) => {
                        return Err(TadoApiError::Http {
                            status,
                            message: body.describe(),
                        });
                    }
                    None => {
                        return Err(TadoApiError::Http {
                            status,
                            message: "unrecognized authorization error".to_string(),
                        });
                    }
                },
                Err(ureq::Error::Transport(t)) => {
                    return Err(TadoApiError::Transport(t.to_string()));
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // OAuth internals
    // ---------------------------------------------------------------

    fn load_persisted_refresh_token(&self) -> Result<Option<String>, TadoApiError> {
        match std::fs::read_to_string(&self.token_file) {
            Ok(s) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TadoApiError::Transport(format!(
                "cannot read token file {}: {}",
                self.token_file.display(),
                e
            ))),
        }
    }

    fn persist_refresh_token(&self, refresh: &str) {
        if let Err(e) = std::fs::write(&self.token_file, refresh) {
            warn!(
                "Failed to persist refresh token to {}: {}",
                self.token_file.display(),
                e
            );
        }
    }

    fn begin_device_flow(&self) -> Result<(), TadoApiError> {
        let resp = self
            .agent
            .post(&format!("{}/device_authorize", self.auth_base_url))
            .set("Accept", "application/json")
            .send_form(&[("client_id", OAUTH_CLIENT_ID), ("scope", OAUTH_SCOPE)]);
        let grant: DeviceAuthorizeGrant = match resp {
            Ok(r) => decode_json(r)?,
            Err(ureq::Error::Status(status, r)) => {
                let body = r.into_string().unwrap_or_else(|_| String::from("<no body>"));
                return Err(TadoApiError::Http { status, message: body });
            }
            Err(ureq::Error::Transport(t)) => {
                return Err(TadoApiError::Transport(t.to_string()));
            }
        };

        let mut s = self.auth.borrow_mut();
        s.pending = Some(PendingActivation {
            device_code: grant.device_code,
            user_code: grant.user_code,
            verification_url: grant.verification_uri_complete.or(grant.verification_uri),
            poll_interval: Duration::from_secs(grant.interval.unwrap_or(5)),
            expires_at: Instant::now() + Duration::from_secs(grant.expires_in),
        });
        s.status = ActivationStatus::Pending;
        Ok(())
    }

    fn refresh_grant(&self, refresh: &str) -> Result<TokenGrant, TadoApiError> {
        let resp = self
            .agent
            .post(&format!("{}/token", self.auth_base_url))
            .set("Accept", "application/json")
            .send_form(&[
                ("client_id", OAUTH_CLIENT_ID),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh),
            ]);
        match resp {
            Ok(r) => decode_json(r),
            Err(ureq::Error::Status(status, r)) => match oauth_error(r) {
                Some(body) if body.error == "invalid_grant" => Err(TadoApiError::Credentials(
                    format!("refresh token rejected: {}", body.describe()),
                )),
                Some(body) => Err(TadoApiError::Http {
                    status,
                    message: body.describe(),
                }),
                None => Err(TadoApiError::Http {
                    status,
                    message: "unrecognized token error".to_string(),
                }),
            },
            Err(ureq::Error::Transport(t)) => Err(TadoApiError::Transport(t.to_string())),
        }
    }

    fn install_grant(&self, grant: TokenGrant) {
        if let Some(refresh) = grant.refresh_token.as_deref() {
            self.persist_refresh_token(refresh);
        }
        let mut s = self.auth.borrow_mut();
        s.token = Some(OAuthToken {
            access_token: grant.access_token,
            expires_at: Instant::now() + Duration::from_secs(grant.expires_in),
            refresh_token: grant.refresh_token,
        });
        s.pending = None;
        s.status = ActivationStatus::Completed;
    }

    /// Current bearer token, refreshed shortly before expiry. API calls
    /// require an activated session.
    fn bearer(&self) -> Result<String, TadoApiError> {
        if self.auth.borrow().status != ActivationStatus::Completed {
            return Err(TadoApiError::Credentials(
                "session is not activated".to_string(),
            ));
        }
        let needs_refresh = match &self.auth.borrow().token {
            None => true,
            Some(t) => Instant::now() + TOKEN_REFRESH_MARGIN >= t.expires_at,
        };
        if needs_refresh {
            self.force_refresh()?;
        }
        let s = self.auth.borrow();
        Ok(s.token.as_ref().map(|t| t.access_token.clone()).unwrap_or_default())
    }

    fn force_refresh(&self) -> Result<(), TadoApiError> {
        let refresh = self
            .auth
            .borrow()
            .token
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or_else(|| TadoApiError::Credentials("no refresh token available".to_string()))?;
        let grant = self.refresh_grant(&refresh)?;
        self.install_grant(grant);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Request plumbing
    // ---------------------------------------------------------------

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn call(
        &self,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ureq::Response, TadoApiError> {
        let url = self.url(path);
        let mut attempted_refresh = false;
        loop {
            let token = self.bearer()?;
            let req = self
                .agent
                .request(method, &url)
                .set("Accept", "application/json")
                .set("Authorization", &format!("Bearer {}", token));
            let resp = match body {
                Some(json) => req.send_json(json.clone()),
                None => req.call(),
            };
            match resp {
                Ok(r) => return Ok(r),
                Err(ureq::Error::Status(401, _)) if !attempted_refresh => {
                    attempted_refresh = true;
                    self.force_refresh()?;
                }
                Err(ureq::Error::Status(status @ (401 | 403), r)) => {
                    let body = r.into_string().unwrap_or_else(|_| String::from("<no body>"));
                    return Err(TadoApiError::Credentials(format!("http {}: {}", status, body)));
                }
                Err(ureq::Error::Status(status, r)) => {
                    let body = r.into_string().unwrap_or_else(|_| String::from("<no body>"));
                    return Err(TadoApiError::Http { status, message: body });
                }
                Err(ureq::Error::Transport(t)) => {
                    return Err(TadoApiError::Transport(t.to_string()));
                }
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TadoApiError> {
        let resp = self.call("GET", path, None)?;
        decode_json(resp)
    }

    /// Mutating call whose response body is irrelevant (204 or echo).
    fn send_command(
        &self,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(), TadoApiError> {
        self.call(method, path, body).map(|_| ())
    }

    // ---------------------------------------------------------------
    // API surface
    // ---------------------------------------------------------------

    pub fn get_me(&self) -> Result<User, TadoApiError> {
        self.get_json("/me")
    }

    pub fn get_home_state(&self, home_id: HomeId) -> Result<HomeState, TadoApiError> {
        self.get_json(&format!("/homes/{}/state", home_id.0))
    }

    pub fn get_mobile_devices(&self, home_id: HomeId) -> Result<Vec<MobileDevice>, TadoApiError> {
        self.get_json(&format!("/homes/{}/mobileDevices", home_id.0))
    }

    pub fn get_zones(&self, home_id: HomeId) -> Result<Vec<Zone>, TadoApiError> {
        self.get_json(&format!("/homes/{}/zones", home_id.0))
    }

    pub fn get_zone_state(&self, home_id: HomeId, zone_id: ZoneId) -> Result<ZoneState, TadoApiError> {
        self.get_json(&format!("/homes/{}/zones/{}/state", home_id.0, zone_id.0))
    }

    pub fn set_presence(&self, home_id: HomeId, presence: HomePresence) -> Result<(), TadoApiError> {
        let body = serde_json::to_value(PresenceLockInput {
            home_presence: presence,
        })
        .map_err(|e| TadoApiError::Decode(e.to_string()))?;
        self.send_command("PUT", &format!("/homes/{}/presenceLock", home_id.0), Some(&body))
    }

    pub fn set_open_window(&self, home_id: HomeId, zone_id: ZoneId) -> Result<(), TadoApiError> {
        self.send_command(
            "POST",
            &format!("/homes/{}/zones/{}/state/openWindow/activate", home_id.0, zone_id.0),
            None,
        )
    }
}

fn decode_json<T: DeserializeOwned>(resp: ureq::Response) -> Result<T, TadoApiError> {
    let mut de = serde_json::Deserializer::from_reader(resp.into_reader());
    serde_path_to_error::deserialize(&mut de).map_err(|e| TadoApiError::Decode(e.to_string()))
}

fn oauth_error(resp: ureq::Response) -> Option<OAuthErrorBody> {
    serde_json::from_reader(resp.into_reader()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_grant_body() -> String {
        json!({
            "access_token": "at-1",
            "token_type": "Bearer",
            "expires_in": 600,
            "refresh_token": "refresh-2"
        })
        .to_string()
    }

    fn client_against(server: &mockito::ServerGuard, dir: &tempfile::TempDir) -> TadoClient {
        TadoClient::with_urls(
            server.url(),
            format!("{}/oauth2", server.url()),
            dir.path().join("token"),
        )
        .expect("client constructs")
    }

    #[test]
    fn persisted_token_short_circuits_to_completed() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "refresh-1").unwrap();
        let token_mock = server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(token_grant_body())
            .create();

        let client = client_against(&server, &dir);
        assert_eq!(client.activation_status(), ActivationStatus::Completed);
        token_mock.assert();
        // rotated refresh token persisted back
        let persisted = std::fs::read_to_string(dir.path().join("token")).unwrap();
        assert_eq!(persisted, "refresh-2");
    }

    #[test]
    fn rejected_refresh_token_is_a_credentials_error() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "stale").unwrap();
        server
            .mock("POST", "/oauth2/token")
            .with_status(400)
            .with_body(json!({"error": "invalid_grant"}).to_string())
            .create();

        let err = TadoClient::with_urls(
            server.url(),
            format!("{}/oauth2", server.url()),
            dir.path().join("token"),
        )
        .expect_err("stale token rejected");
        assert!(err.is_credentials());
    }

    #[test]
    fn missing_token_file_starts_device_flow() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        server
            .mock("POST", "/oauth2/device_authorize")
            .with_status(200)
            .with_body(
                json!({
                    "device_code": "dc-1",
                    "user_code": "ABC123",
                    "verification_uri": "https://login.tado.com/device",
                    "verification_uri_complete": "https://login.tado.com/device?user_code=ABC123",
                    "expires_in": 300,
                    "interval": 0
                })
                .to_string(),
            )
            .create();

        let client = client_against(&server, &dir);
        assert_eq!(client.activation_status(), ActivationStatus::Pending);
        assert_eq!(client.user_code().as_deref(), Some("ABC123"));
        assert_eq!(
            client.verification_url().as_deref(),
            Some("https://login.tado.com/device?user_code=ABC123")
        );
    }

    #[test]
    fn device_activation_installs_tokens_on_approval() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        server
            .mock("POST", "/oauth2/device_authorize")
            .with_status(200)
            .with_body(
                json!({
                    "device_code": "dc-1",
                    "user_code": "ABC123",
                    "verification_uri_complete": "https://login.tado.com/device?user_code=ABC123",
                    "expires_in": 300,
                    "interval": 0
                })
                .to_string(),
            )
            .create();
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(token_grant_body())
            .create();

        let client = client_against(&server, &dir);
        assert_eq!(client.device_activation().unwrap(), true);
        assert_eq!(client.activation_status(), ActivationStatus::Completed);
        let persisted = std::fs::read_to_string(dir.path().join("token")).unwrap();
        assert_eq!(persisted, "refresh-2");
    }

    #[test]
    fn device_activation_reports_expiry_as_false() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        server
            .mock("POST", "/oauth2/device_authorize")
            .with_status(200)
            .with_body(
                json!({
                    "device_code": "dc-1",
                    "user_code": "ABC123",
                    "expires_in": 0,
                    "interval": 0
                })
                .to_string(),
            )
            .create();

        let client = client_against(&server, &dir);
        assert_eq!(client.device_activation().unwrap(), false);
        assert_eq!(client.activation_status(), ActivationStatus::Pending);
    }

    #[test]
    fn get_home_state_decodes_presence() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "refresh-1").unwrap();
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(token_grant_body())
            .create();
        server
            .mock("GET", "/homes/7/state")
            .with_status(200)
            .with_body(json!({"presence": "AWAY", "presenceLocked": false}).to_string())
            .create();

        let client = client_against(&server, &dir);
        let state = client.get_home_state(HomeId(7)).unwrap();
        assert_eq!(state.presence, Some(HomePresence::Away));
    }

    #[test]
    fn persistent_unauthorized_is_a_credentials_error() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "refresh-1").unwrap();
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(token_grant_body())
            .expect(2) // construction + the forced refresh after the first 401
            .create();
        server
            .mock("GET", "/me")
            .with_status(401)
            .with_body("{}")
            .expect(2)
            .create();

        let client = client_against(&server, &dir);
        let err = client.get_me().expect_err("unauthorized");
        assert!(err.is_credentials());
    }
}
