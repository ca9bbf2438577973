//! Automatic role selection for team races
//!
//! In a team event every teammate runs the application against the same
//! simulator session. Whoever is in the car hosts; everybody else joins. The
//! room name is derived from the session and team ids, so teammates find each
//! other without exchanging anything.
//!
//! ```text
//! session snapshot ──▶ SessionID, TeamRacing, DriverCarIdx, player TeamID ─┐
//! telemetry frame  ──▶ IsOnTrack ──────────────────────────────────────────┤
//!                                                                          ▼
//!                                      LocalFacts ──decide()──▶ Host / Join / None
//! ```

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::DEFAULT_UNWRAP_DEPTH;
use crate::normalize::peel;
use crate::sync::RoleCoordinator;
use crate::types::Role;

/// Room id shared by one team in one simulator session
pub fn room_id(session_id: i64, team_id: i64) -> String {
    format!("ird-team-{}-{}", session_id, team_id)
}

/// What this process knows about its own driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFacts {
    pub session_id: Option<i64>,
    /// -1 until the simulator reports the player's car
    pub player_car_idx: i64,
    pub team_id: Option<i64>,
    pub is_team_racing: bool,
    pub on_track: bool,
}

impl Default for LocalFacts {
    fn default() -> Self {
        Self {
            session_id: None,
            player_car_idx: -1,
            team_id: None,
            is_team_racing: false,
            on_track: false,
        }
    }
}

impl LocalFacts {
    /// Pick up session, car and team facts from a full session snapshot
    pub fn absorb_session(&mut self, session: &Value) {
        let weekend = session.get("WeekendInfo");
        let driver_info = session.get("DriverInfo");

        self.session_id = weekend.and_then(|w| w.get("SessionID")).and_then(as_int);
        self.is_team_racing = weekend
            .and_then(|w| w.get("TeamRacing"))
            .map(truthy)
            .unwrap_or(false);
        self.player_car_idx = driver_info
            .and_then(|d| d.get("DriverCarIdx"))
            .and_then(as_int)
            .unwrap_or(-1);

        let car_idx = self.player_car_idx;
        self.team_id = driver_info
            .and_then(|d| d.get("Drivers"))
            .and_then(Value::as_array)
            .and_then(|drivers| {
                drivers
                    .iter()
                    .find(|d| d.get("CarIdx").and_then(as_int) == Some(car_idx))
            })
            .and_then(|d| d.get("TeamID"))
            .and_then(as_int);
    }

    /// Pick up the on-track flag from a telemetry record
    pub fn absorb_telemetry(&mut self, telemetry: &Map<String, Value>) {
        self.on_track = telemetry
            .get("IsOnTrack")
            .and_then(|raw| peel(raw, DEFAULT_UNWRAP_DEPTH))
            .map(|v| truthy(&v))
            .unwrap_or(false);
    }

    /// The team room, when the facts make this a shareable team session
    pub fn room(&self) -> Option<String> {
        let session_id = self.session_id.filter(|id| *id != 0)?;
        if self.player_car_idx == -1 || !self.is_team_racing {
            return None;
        }
        let team_id = self.team_id.filter(|id| *id != 0)?;
        Some(room_id(session_id, team_id))
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// Outcome of one auto-sync evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoSyncAction {
    /// Nothing to change
    None,
    /// Host the given room
    Host(String),
    /// Join the given room as guest
    Join(String),
}

/// Decide what the coordinator should do for the current facts and mode
pub fn decide(enabled: bool, facts: &LocalFacts, mode: Role) -> AutoSyncAction {
    if !enabled {
        return AutoSyncAction::None;
    }
    let Some(room) = facts.room() else {
        return AutoSyncAction::None;
    };
    match (facts.on_track, mode) {
        (true, Role::Host) | (false, Role::Guest) => AutoSyncAction::None,
        (true, _) => AutoSyncAction::Host(room),
        (false, _) => AutoSyncAction::Join(room),
    }
}

/// Keeps the coordinator's role in line with the driver's situation
#[derive(Debug, Clone, Default)]
pub struct AutoTeamSync {
    enabled: bool,
    facts: LocalFacts,
}

impl AutoTeamSync {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            facts: LocalFacts::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn facts(&self) -> &LocalFacts {
        &self.facts
    }

    pub fn observe_session(&mut self, session: &Value) {
        self.facts.absorb_session(session);
    }

    pub fn observe_telemetry(&mut self, telemetry: &Map<String, Value>) {
        self.facts.absorb_telemetry(telemetry);
    }

    /// Turn auto-sync on or off. Turning it off stops sharing.
    pub fn set_enabled(&mut self, enabled: bool, coordinator: &RoleCoordinator) {
        self.enabled = enabled;
        info!(enabled, "Auto team sync toggled");
        if !enabled {
            coordinator.stop();
        }
    }

    /// Evaluate the facts and drive the coordinator accordingly
    pub fn apply(&self, coordinator: &RoleCoordinator) -> AutoSyncAction {
        let action = decide(self.enabled, &self.facts, coordinator.mode());
        match &action {
            AutoSyncAction::Host(room) => {
                info!(%room, "On track, hosting team room");
                coordinator.start_hosting(Some(room));
            }
            AutoSyncAction::Join(room) => {
                info!(%room, "Off track, joining team room");
                coordinator.join_session(room);
            }
            AutoSyncAction::None => debug!(facts = ?self.facts, "Auto team sync: nothing to do"),
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn team_session() -> Value {
        json!({
            "WeekendInfo": {"SessionID": 4412, "TeamRacing": 1},
            "DriverInfo": {
                "DriverCarIdx": 3,
                "Drivers": [
                    {"CarIdx": 1, "TeamID": 90},
                    {"CarIdx": 3, "TeamID": 7},
                ]
            }
        })
    }

    fn eligible_facts(on_track: bool) -> LocalFacts {
        let mut facts = LocalFacts::default();
        facts.absorb_session(&team_session());
        facts.on_track = on_track;
        facts
    }

    #[test]
    fn test_room_id_format() {
        assert_eq!(room_id(4412, 7), "ird-team-4412-7");
    }

    #[test]
    fn test_absorb_session_finds_player_team() {
        let facts = eligible_facts(false);
        assert_eq!(facts.session_id, Some(4412));
        assert_eq!(facts.player_car_idx, 3);
        assert_eq!(facts.team_id, Some(7));
        assert!(facts.is_team_racing);
        assert_eq!(facts.room().as_deref(), Some("ird-team-4412-7"));
    }

    #[test]
    fn test_absorb_telemetry_peels_on_track() {
        let mut facts = LocalFacts::default();
        let telemetry = json!({"IsOnTrack": {"value": [true]}});
        facts.absorb_telemetry(telemetry.as_object().unwrap());
        assert!(facts.on_track);

        let telemetry = json!({"IsOnTrack": {"value": [0]}});
        facts.absorb_telemetry(telemetry.as_object().unwrap());
        assert!(!facts.on_track);
    }

    #[test]
    fn test_ineligible_sessions_do_nothing() {
        let mut facts = eligible_facts(true);
        facts.is_team_racing = false;
        assert_eq!(decide(true, &facts, Role::Idle), AutoSyncAction::None);

        let mut facts = eligible_facts(true);
        facts.player_car_idx = -1;
        assert_eq!(decide(true, &facts, Role::Idle), AutoSyncAction::None);

        let mut facts = eligible_facts(true);
        facts.team_id = Some(0);
        assert_eq!(decide(true, &facts, Role::Idle), AutoSyncAction::None);

        let mut facts = eligible_facts(true);
        facts.session_id = None;
        assert_eq!(decide(true, &facts, Role::Idle), AutoSyncAction::None);

        assert_eq!(decide(false, &eligible_facts(true), Role::Idle), AutoSyncAction::None);
    }

    #[test]
    fn test_on_track_hosts_off_track_joins() {
        let room = "ird-team-4412-7".to_string();
        assert_eq!(decide(true, &eligible_facts(true), Role::Idle), AutoSyncAction::Host(room.clone()));
        assert_eq!(decide(true, &eligible_facts(true), Role::Guest), AutoSyncAction::Host(room.clone()));
        assert_eq!(decide(true, &eligible_facts(true), Role::Host), AutoSyncAction::None);

        assert_eq!(decide(true, &eligible_facts(false), Role::Idle), AutoSyncAction::Join(room.clone()));
        assert_eq!(decide(true, &eligible_facts(false), Role::Host), AutoSyncAction::Join(room));
        assert_eq!(decide(true, &eligible_facts(false), Role::Guest), AutoSyncAction::None);
    }

    #[tokio::test]
    async fn test_apply_and_disable_drive_coordinator() {
        use crate::sync::LoopbackNetwork;
        use std::sync::Arc;

        let coordinator = RoleCoordinator::new(Arc::new(LoopbackNetwork::new()));
        let mut auto = AutoTeamSync::new(true);
        auto.observe_session(&team_session());
        auto.observe_telemetry(json!({"IsOnTrack": true}).as_object().unwrap());

        assert_eq!(auto.apply(&coordinator), AutoSyncAction::Host("ird-team-4412-7".into()));
        assert!(coordinator.is_local_host());
        // Already host: second pass is a no-op
        assert_eq!(auto.apply(&coordinator), AutoSyncAction::None);

        auto.set_enabled(false, &coordinator);
        assert_eq!(coordinator.mode(), Role::Idle);
        assert_eq!(auto.apply(&coordinator), AutoSyncAction::None);
    }
}
