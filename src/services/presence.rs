//! Geofencing: reconcile the account's HOME/AWAY mode against the set of
//! geo-tracked mobile devices currently at home.

use log::warn;

use crate::client::{TadoApiError, TadoClient};
use crate::models::tado::{HomeId, HomePresence, MobileDevice};
use crate::notify::Notifier;

/// One reconciliation pass: re-read the account mode and device locations,
/// then issue at most one mode change. Re-running with unchanged inputs
/// performs no remote mutation.
pub fn reconcile(
    client: &TadoClient,
    home_id: HomeId,
    notifier: &mut Notifier,
) -> Result<(), TadoApiError> {
    let state = client.get_home_state(home_id)?;
    let presence = state
        .presence
        .ok_or_else(|| TadoApiError::Decode("home state carried no presence field".to_string()))?;
    let devices = client.get_mobile_devices(home_id)?;
    let at_home = devices_at_home(&devices);

    match presence_correction(at_home.is_empty(), presence) {
        None => {
            notifier.steady(&format!(
                "Presence: {} device(s) at home ({}), mode {}. No change needed.",
                at_home.len(),
                describe_devices(&at_home),
                presence_label(presence)
            ));
        }
        Some(HomePresence::Home) => {
            notifier.announce(&format!(
                "{} at home but mode is AWAY; activating HOME mode.",
                describe_devices(&at_home)
            ));
            client.set_presence(home_id, HomePresence::Home)?;
            notifier.announce("HOME mode activated.");
        }
        Some(HomePresence::Away) => {
            notifier.announce("No devices at home but mode is HOME; activating AWAY mode.");
            client.set_presence(home_id, HomePresence::Away)?;
            notifier.announce("AWAY mode activated.");
        }
    }
    Ok(())
}

/// The four-rule decision over {snapshot empty} x {HOME, AWAY}. The two
/// matching combinations need no correction.
fn presence_correction(snapshot_empty: bool, presence: HomePresence) -> Option<HomePresence> {
    match (snapshot_empty, presence) {
        (true, HomePresence::Home) => Some(HomePresence::Away),
        (false, HomePresence::Away) => Some(HomePresence::Home),
        _ => None,
    }
}

/// Names of geo-tracked devices reporting `atHome`. A tracked device without
/// location data is an unknown, not an absence: it is warned about and left
/// out of the snapshot.
fn devices_at_home(devices: &[MobileDevice]) -> Vec<String> {
    let mut names = Vec::new();
    for device in devices {
        let tracked = device
            .settings
            .as_ref()
            .and_then(|s| s.geo_tracking_enabled)
            .unwrap_or(false);
        if !tracked {
            continue;
        }
        match device.location.as_ref().and_then(|l| l.at_home) {
            Some(true) => names.push(device.display_name()),
            Some(false) => {}
            None => warn!(
                "No location reported for {}; geofencing cannot count it",
                device.display_name()
            ),
        }
    }
    names
}

fn presence_label(presence: HomePresence) -> &'static str {
    match presence {
        HomePresence::Home => "HOME",
        HomePresence::Away => "AWAY",
    }
}

fn describe_devices(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}
