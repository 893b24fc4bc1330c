//! Open-window detection: engage the heating override on zones whose
//! window sensor has fired.

use log::warn;

use crate::client::{TadoApiError, TadoClient};
use crate::models::tado::{HomeId, Zone, ZoneId};
use crate::notify::Notifier;

/// Check every zone independently and activate the open-window override
/// where a window is detected and the override is not yet engaged.
///
/// A failure in one zone never aborts the remaining zones; only a
/// credentials error (or a failure to list the zones at all) propagates.
pub fn check_zones(
    client: &TadoClient,
    home_id: HomeId,
    notifier: &mut Notifier,
) -> Result<(), TadoApiError> {
    let zones = client.get_zones(home_id)?;
    for zone in &zones {
        let Some(zone_id) = zone.id else {
            warn!("Zone without an id in the zones response; skipping it");
            continue;
        };
        let name = zone_label(zone, zone_id);
        match check_zone(client, home_id, zone_id, &name, notifier) {
            Ok(()) => {}
            Err(e) if e.is_credentials() => return Err(e),
            Err(e) => warn!("{}: open-window check failed: {}", name, e),
        }
    }
    Ok(())
}

fn check_zone(
    client: &TadoClient,
    home_id: HomeId,
    zone_id: ZoneId,
    name: &str,
    notifier: &mut Notifier,
) -> Result<(), TadoApiError> {
    let state = client.get_zone_state(home_id, zone_id)?;
    let detected = state.open_window_detected.unwrap_or(false);
    let active = state.open_window.is_some();
    if !needs_activation(detected, active) {
        return Ok(());
    }
    notifier.announce(&format!(
        "{}: open window detected, activating the open-window mode.",
        name
    ));
    client.set_open_window(home_id, zone_id)?;
    notifier.announce(&format!("{}: open-window mode activated.", name));
    Ok(())
}

/// Activation fires only on a detection without an engaged override, so a
/// contiguous run of "detected" polls issues at most one activation.
fn needs_activation(detected: bool, active: bool) -> bool {
    detected && !active
}

fn zone_label(zone: &Zone, zone_id: ZoneId) -> String {
    match &zone.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("zone-{}", zone_id.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn activation_requires_detection_without_override() {
        assert!(needs_activation(true, false));
        assert!(!needs_activation(true, true));
        assert!(!needs_activation(false, false));
        assert!(!needs_activation(false, true));
    }

    fn ready_client(
        server: &mockito::ServerGuard,
        dir: &tempfile::TempDir,
    ) -> crate::client::TadoClient {
        std::fs::write(dir.path().join("token"), "refresh-1").unwrap();
        crate::client::TadoClient::with_urls(
            server.url(),
            format!("{}/oauth2", server.url()),
            dir.path().join("token"),
        )
        .unwrap()
    }

    fn mock_token_grant(server: &mut mockito::ServerGuard) {
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(
                json!({"access_token": "at-1", "expires_in": 600, "refresh_token": "refresh-2"})
                    .to_string(),
            )
            .create();
    }

    // End-to-end: a detected window activates the override exactly once;
    // the next poll sees the override engaged and issues nothing.
    #[test]
    fn detection_activates_override_once() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        mock_token_grant(&mut server);
        server
            .mock("GET", "/homes/7/zones")
            .with_status(200)
            .with_body(json!([{"id": 3, "name": "Bedroom", "type": "HEATING"}]).to_string())
            .create();
        server
            .mock("GET", "/homes/7/zones/3/state")
            .with_status(200)
            .with_body(json!({"openWindowDetected": true}).to_string())
            .create();
        let activate_mock = server
            .mock("POST", "/homes/7/zones/3/state/openWindow/activate")
            .with_status(204)
            .expect(1)
            .create();

        let client = ready_client(&server, &dir);
        let mut notifier = Notifier::new();
        check_zones(&client, HomeId(7), &mut notifier).unwrap();

        // Still detected, but the override is engaged now.
        server
            .mock("GET", "/homes/7/zones/3/state")
            .with_status(200)
            .with_body(
                json!({"openWindowDetected": true, "openWindow": {"durationInSeconds": 900}})
                    .to_string(),
            )
            .create();
        check_zones(&client, HomeId(7), &mut notifier).unwrap();

        activate_mock.assert();
    }

    // One zone erroring out must not stop the others from being checked.
    #[test]
    fn zone_failures_are_isolated() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        mock_token_grant(&mut server);
        server
            .mock("GET", "/homes/7/zones")
            .with_status(200)
            .with_body(
                json!([
                    {"id": 3, "name": "Bedroom"},
                    {"name": "orphan zone"},
                    {"id": 4, "name": "Kitchen"}
                ])
                .to_string(),
            )
            .create();
        server
            .mock("GET", "/homes/7/zones/3/state")
            .with_status(500)
            .with_body("boom")
            .create();
        let kitchen_state = server
            .mock("GET", "/homes/7/zones/4/state")
            .with_status(200)
            .with_body(json!({"openWindowDetected": false}).to_string())
            .expect(1)
            .create();

        let client = ready_client(&server, &dir);
        let mut notifier = Notifier::new();
        check_zones(&client, HomeId(7), &mut notifier).unwrap();
        kitchen_state.assert();
    }
}
