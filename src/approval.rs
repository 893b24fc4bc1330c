//! Best-effort automated approval of a pending device authorization.
//!
//! Drives a W3C WebDriver endpoint (geckodriver or compatible) through the
//! two-stage Tado approval flow: submit the pre-filled device-code form,
//! then sign in with the configured account credentials. Success means the
//! form was submitted; the engine still confirms activation by polling the
//! auth service, so a false positive here costs nothing.
//!
//! Every failure path is caught and reported as `false` — the engine always
//! emits manual-approval instructions as well, and must never depend on
//! automation succeeding.

use log::{debug, info};
use serde_json::{Value, json};
use std::time::Duration;

use crate::config::Config;

/// CSS selector for the pre-filled device-code form.
const DEVICE_FORM_SELECTOR: &str = "#device-form";
/// Submit button on the device-code page.
const DEVICE_SUBMIT_SELECTOR: &str = "button.c-btn.c-btn--primary.primary.button";
/// Credential fields and sign-in button on the login page.
const LOGIN_USER_SELECTOR: &str = "#loginId";
const LOGIN_PASS_SELECTOR: &str = "#password";
const LOGIN_SUBMIT_SELECTOR: &str = "button.c-btn.c-btn--primary.button";

/// Element-id key mandated by the WebDriver spec.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const IMPLICIT_WAIT_MS: u64 = 20_000;

pub struct BrowserApproval {
    agent: ureq::Agent,
    driver_url: String,
    username: String,
    password: String,
}

impl BrowserApproval {
    /// Available only when both credentials are configured.
    pub fn from_config(cfg: &Config) -> Option<Self> {
        match (cfg.username.clone(), cfg.password.clone()) {
            (Some(username), Some(password)) => Some(BrowserApproval {
                agent: ureq::AgentBuilder::new()
                    .timeout(Duration::from_secs(60))
                    .build(),
                driver_url: cfg.webdriver_url.clone(),
                username,
                password,
            }),
            _ => None,
        }
    }

    /// Attempt the automated approval. Never propagates a failure.
    pub fn attempt(&self, verification_url: &str, user_code: &str) -> bool {
        info!("Attempting automated browser approval for code {}", user_code);
        match self.run_flow(verification_url) {
            Ok(()) => {
                info!("Automated approval submitted; awaiting confirmation from the API");
                true
            }
            Err(e) => {
                info!("Automated approval failed ({}); manual approval required", e);
                false
            }
        }
    }

    fn run_flow(&self, verification_url: &str) -> Result<(), String> {
        let session = self.new_session()?;
        let result = self.drive(&session, verification_url);
        // Always tear the browser session down, even on failure.
        let _ = self.delete_session(&session);
        result
    }

    fn drive(&self, session: &str, verification_url: &str) -> Result<(), String> {
        self.set_implicit_wait(session)?;
        self.navigate(session, verification_url)?;

        // Stage 1: device-code page. The code is pre-filled via the URL; if
        // the form is not there we are already past this stage.
        match self.find_element(session, DEVICE_FORM_SELECTOR) {
            Ok(_) => {
                let submit = self.find_element(session, DEVICE_SUBMIT_SELECTOR)?;
                self.click(session, &submit)?;
                debug!("Submitted device-code form");
            }
            Err(_) => debug!("Device-code form not present; assuming it was already submitted"),
        }

        // Stage 2: login page.
        let user_field = self
            .find_element(session, LOGIN_USER_SELECTOR)
            .map_err(|e| format!("login page did not appear: {}", e))?;
        self.send_keys(session, &user_field, &self.username)?;
        let pass_field = self.find_element(session, LOGIN_PASS_SELECTOR)?;
        self.send_keys(session, &pass_field, &self.password)?;
        let sign_in = self.find_element(session, LOGIN_SUBMIT_SELECTOR)?;
        self.click(session, &sign_in)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Minimal W3C WebDriver protocol plumbing
    // ---------------------------------------------------------------

    fn new_session(&self) -> Result<String, String> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "firefox",
                    "moz:firefoxOptions": {"args": ["-headless", "--window-size=1920,1080"]}
                }
            }
        });
        let value = self.post(&format!("{}/session", self.driver_url), &body)?;
        value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "webdriver session response carried no sessionId".to_string())
    }

    fn delete_session(&self, session: &str) -> Result<(), String> {
        self.agent
            .delete(&format!("{}/session/{}", self.driver_url, session))
            .call()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn set_implicit_wait(&self, session: &str) -> Result<(), String> {
        self.post(
            &format!("{}/session/{}/timeouts", self.driver_url, session),
            &json!({"implicit": IMPLICIT_WAIT_MS}),
        )
        .map(|_| ())
    }

    fn navigate(&self, session: &str, url: &str) -> Result<(), String> {
        self.post(
            &format!("{}/session/{}/url", self.driver_url, session),
            &json!({"url": url}),
        )
        .map(|_| ())
    }

    fn find_element(&self, session: &str, selector: &str) -> Result<String, String> {
        let value = self.post(
            &format!("{}/session/{}/element", self.driver_url, session),
            &json!({"using": "css selector", "value": selector}),
        )?;
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("no element id in response for selector {}", selector))
    }

    fn click(&self, session: &str, element: &str) -> Result<(), String> {
        self.post(
            &format!("{}/session/{}/element/{}/click", self.driver_url, session, element),
            &json!({}),
        )
        .map(|_| ())
    }

    fn send_keys(&self, session: &str, element: &str, text: &str) -> Result<(), String> {
        self.post(
            &format!("{}/session/{}/element/{}/value", self.driver_url, session, element),
            &json!({"text": text}),
        )
        .map(|_| ())
    }

    /// POST a command and unwrap the spec-mandated `value` envelope.
    fn post(&self, url: &str, body: &Value) -> Result<Value, String> {
        let resp = self
            .agent
            .post(url)
            .set("Content-Type", "application/json")
            .send_json(body.clone())
            .map_err(|e| match e {
                ureq::Error::Status(status, r) => format!(
                    "webdriver http {}: {}",
                    status,
                    r.into_string().unwrap_or_else(|_| "<no body>".to_string())
                ),
                ureq::Error::Transport(t) => format!("webdriver transport error: {}", t),
            })?;
        let parsed: Value = resp
            .into_json()
            .map_err(|e| format!("webdriver response is not json: {}", e))?;
        Ok(parsed.get("value").cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config_with_credentials(webdriver_url: String) -> Config {
        Config {
            token_file: PathBuf::from("/tmp/token"),
            check_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(30),
            healthcheck_port: 8080,
            username: Some("user@example.com".to_string()),
            password: Some("hunter2".to_string()),
            webdriver_url,
        }
    }

    #[test]
    fn absent_credentials_disable_automation() {
        let mut cfg = config_with_credentials("http://localhost:4444".to_string());
        cfg.password = None;
        assert!(BrowserApproval::from_config(&cfg).is_none());
    }

    #[test]
    fn unreachable_webdriver_reports_false() {
        let mut server = mockito::Server::new();
        let session_mock = server
            .mock("POST", "/session")
            .with_status(500)
            .with_body("{}")
            .expect(1)
            .create();

        let approval = BrowserApproval::from_config(&config_with_credentials(server.url()))
            .expect("credentials configured");
        assert!(!approval.attempt("https://login.tado.com/device?user_code=ABC123", "ABC123"));
        session_mock.assert();
    }
}
