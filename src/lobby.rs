//! Lobby roster and its per-peer phase.
//!
//! [`Roster`] is the aggregate every handler mutates: members in join order,
//! the member and team lookups, and who the host is. On the host it is the
//! authoritative copy; on every other peer it is a replica that
//! [`apply_snapshot`](Roster::apply_snapshot) overwrites wholesale.
//!
//! Team membership is derived. Every operation that can change a member's
//! `team_id` ends with [`recompute_teams`](Roster::recompute_teams), which
//! rebuilds all teams' `member_ids` by partitioning the member set.

use serde::Serialize;
use tracing::debug;

use crate::error::{LobbyError, Result};
use crate::protocol::{Member, MemberLookup, PeerId, Snapshot, Team, TeamId, TeamLookup};

/// Where this peer stands relative to a lobby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LobbyPhase {
    #[default]
    Unregistered,
    /// Owner of the authoritative roster.
    Hosting,
    /// Dialed the host; waiting for `ACK_JOIN_LOBBY`.
    JoiningPending,
    /// Holding a replica received from the host.
    Joined,
}

/// The local lobby aggregate.
#[derive(Debug, Clone)]
pub struct Roster {
    lobby_id: Option<PeerId>,
    my_id: Option<PeerId>,
    phase: LobbyPhase,
    member_ids: Vec<PeerId>,
    member_lookup: MemberLookup,
    team_lookup: TeamLookup,
    default_teams: Vec<Team>,
}

impl Roster {
    /// An unregistered roster that will seed `default_teams` when hosting.
    pub fn new(default_teams: Vec<Team>) -> Self {
        let mut roster = Self {
            lobby_id: None,
            my_id: None,
            phase: LobbyPhase::Unregistered,
            member_ids: Vec::new(),
            member_lookup: MemberLookup::new(),
            team_lookup: TeamLookup::new(),
            default_teams,
        };
        roster.reset_teams();
        roster
    }

    fn reset_teams(&mut self) {
        self.team_lookup = self
            .default_teams
            .iter()
            .map(|team| {
                let mut team = team.clone();
                team.member_ids.clear();
                (team.id.clone(), team)
            })
            .collect();
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// `UNREGISTERED → HOSTING`: self becomes the only member and the lobby id.
    pub fn host(&mut self, lobby_id: impl Into<PeerId>, display_name: impl Into<String>) {
        let lobby_id = lobby_id.into();
        self.lobby_id = Some(lobby_id.clone());
        self.my_id = Some(lobby_id.clone());
        self.phase = LobbyPhase::Hosting;
        self.member_lookup.clear();
        self.member_lookup
            .insert(lobby_id.clone(), Member::new(lobby_id.clone(), display_name));
        self.member_ids = vec![lobby_id];
        self.reset_teams();
        debug!(lobby_id = ?self.lobby_id, "roster hosting");
    }

    /// `UNREGISTERED → JOINING_PENDING`. Self is known locally until the
    /// host's snapshot replaces the replica.
    pub fn begin_join(
        &mut self,
        my_id: impl Into<PeerId>,
        lobby_id: impl Into<PeerId>,
        display_name: impl Into<String>,
    ) {
        let my_id = my_id.into();
        self.my_id = Some(my_id.clone());
        self.lobby_id = Some(lobby_id.into());
        self.phase = LobbyPhase::JoiningPending;
        self.member_lookup.clear();
        self.member_lookup
            .insert(my_id.clone(), Member::new(my_id.clone(), display_name));
        self.member_ids = vec![my_id];
        self.reset_teams();
    }

    /// `JOINING_PENDING → JOINED`.
    pub fn enter_joined(&mut self) {
        self.phase = LobbyPhase::Joined;
    }

    // ── Members ─────────────────────────────────────────────────────

    /// Record an introduced peer. Existing entries keep their ready and team
    /// state; only the display name is refreshed.
    pub fn upsert_member(&mut self, id: &str, display_name: &str) {
        match self.member_lookup.get_mut(id) {
            Some(member) => member.display_name = display_name.to_string(),
            None => {
                self.member_lookup
                    .insert(id.to_string(), Member::new(id, display_name));
            }
        }
    }

    /// Add a known member to the lobby. Returns `false` if already present.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::UnknownMember`] if the peer was never introduced.
    pub fn admit(&mut self, id: &str) -> Result<bool> {
        if !self.member_lookup.contains_key(id) {
            return Err(LobbyError::UnknownMember(id.to_string()));
        }
        if self.member_ids.iter().any(|existing| existing == id) {
            return Ok(false);
        }
        self.member_ids.push(id.to_string());
        Ok(true)
    }

    /// Flip a member's ready flag and return the new value.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::UnknownMember`] if the member does not exist.
    pub fn toggle_ready(&mut self, id: &str) -> Result<bool> {
        let member = self
            .member_lookup
            .get_mut(id)
            .ok_or_else(|| LobbyError::UnknownMember(id.to_string()))?;
        member.is_ready = !member.is_ready;
        Ok(member.is_ready)
    }

    /// Assign a member to a team and recompute every team's membership.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::UnknownTeam`] or [`LobbyError::UnknownMember`];
    /// nothing changes in either case.
    pub fn set_team(&mut self, member_id: &str, team_id: &str) -> Result<()> {
        if !self.team_lookup.contains_key(team_id) {
            return Err(LobbyError::UnknownTeam(team_id.to_string()));
        }
        let member = self
            .member_lookup
            .get_mut(member_id)
            .ok_or_else(|| LobbyError::UnknownMember(member_id.to_string()))?;
        member.team_id = Some(team_id.to_string());
        self.recompute_teams();
        Ok(())
    }

    /// Drop a departed peer from the lobby. Self is never removed.
    /// Returns `true` if the member was part of the lobby.
    pub fn remove_member(&mut self, id: &str) -> bool {
        if self.my_id.as_deref() == Some(id) {
            return false;
        }
        let before = self.member_ids.len();
        self.member_ids.retain(|existing| existing != id);
        let removed_from_lobby = self.member_ids.len() != before;
        let removed_lookup = self.member_lookup.remove(id).is_some();
        if removed_lookup {
            self.recompute_teams();
        }
        removed_from_lobby
    }

    /// Rebuild every team's `member_ids` from the members' `team_id`s.
    ///
    /// Members pointing at a team that does not exist lose their assignment.
    pub fn recompute_teams(&mut self) {
        for team in self.team_lookup.values_mut() {
            team.member_ids.clear();
        }
        for member in self.member_lookup.values_mut() {
            let Some(team_id) = member.team_id.as_ref() else {
                continue;
            };
            match self.team_lookup.get_mut(team_id) {
                Some(team) => team.member_ids.push(member.id.clone()),
                None => member.team_id = None,
            }
        }
    }

    // ── Snapshots ───────────────────────────────────────────────────

    /// The host's full state triple.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            member_lookup: self.member_lookup.clone(),
            team_lookup: self.team_lookup.clone(),
            lobby_member_ids: self.member_ids.clone(),
        }
    }

    /// Replace the replica with a host snapshot. Team membership is
    /// re-derived locally so the replica holds the invariant even if the
    /// shipped lists disagree.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let mut seen = std::collections::HashSet::new();
        self.member_ids = snapshot
            .lobby_member_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        self.member_lookup = snapshot.member_lookup;
        self.team_lookup = snapshot.team_lookup;
        self.recompute_teams();
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn phase(&self) -> LobbyPhase {
        self.phase
    }

    pub fn is_hosting(&self) -> bool {
        self.phase == LobbyPhase::Hosting
    }

    pub fn my_id(&self) -> Option<&PeerId> {
        self.my_id.as_ref()
    }

    pub fn lobby_id(&self) -> Option<&PeerId> {
        self.lobby_id.as_ref()
    }

    /// Whether `from` is the host this peer recorded when joining.
    pub fn is_lobby_host(&self, from: &str) -> bool {
        self.lobby_id.as_deref() == Some(from)
    }

    pub fn member_ids(&self) -> &[PeerId] {
        &self.member_ids
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.member_lookup.get(id)
    }

    pub fn member_lookup(&self) -> &MemberLookup {
        &self.member_lookup
    }

    pub fn team(&self, id: &str) -> Option<&Team> {
        self.team_lookup.get(id)
    }

    pub fn team_lookup(&self) -> &TeamLookup {
        &self.team_lookup
    }

    pub fn has_team(&self, id: &TeamId) -> bool {
        self.team_lookup.contains_key(id)
    }

    /// Lobby members other than self, in join order.
    pub fn other_member_ids(&self) -> impl Iterator<Item = &PeerId> {
        let me = self.my_id.as_deref();
        self.member_ids
            .iter()
            .filter(move |id| Some(id.as_str()) != me)
    }
}

/// Read-only snapshot handed to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyView {
    pub my_id: Option<PeerId>,
    pub is_hosting: bool,
    pub lobby_id: Option<PeerId>,
    pub lobby_member_ids: Vec<PeerId>,
    pub member_lookup: MemberLookup,
    pub team_lookup: TeamLookup,
    /// Accumulated error notes, newline separated. Empty when nothing went wrong.
    pub error_message: String,
    pub phase: LobbyPhase,
}

impl LobbyView {
    pub(crate) fn from_roster(roster: &Roster, error_message: String) -> Self {
        Self {
            my_id: roster.my_id().cloned(),
            is_hosting: roster.is_hosting(),
            lobby_id: roster.lobby_id().cloned(),
            lobby_member_ids: roster.member_ids().to_vec(),
            member_lookup: roster.member_lookup().clone(),
            team_lookup: roster.team_lookup().clone(),
            error_message,
            phase: roster.phase(),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::config::default_teams;

    fn hosted() -> Roster {
        let mut roster = Roster::new(default_teams());
        roster.host("host1", "Alice");
        roster
    }

    fn assert_derivation_holds(roster: &Roster) {
        for team in roster.team_lookup().values() {
            let mut expected: Vec<&str> = roster
                .member_lookup()
                .values()
                .filter(|m| m.team_id.as_deref() == Some(team.id.as_str()))
                .map(|m| m.id.as_str())
                .collect();
            let mut actual: Vec<&str> = team.member_ids.iter().map(String::as_str).collect();
            expected.sort_unstable();
            actual.sort_unstable();
            assert_eq!(actual, expected, "team {}", team.id);
        }
    }

    #[test]
    fn hosting_seeds_self_and_empty_default_teams() {
        let roster = hosted();
        assert_eq!(roster.phase(), LobbyPhase::Hosting);
        assert_eq!(roster.member_ids(), ["host1".to_string()]);
        assert_eq!(roster.lobby_id().unwrap(), "host1");
        assert_eq!(roster.team("1").unwrap().color, "#ccffcc");
        assert_eq!(roster.team("2").unwrap().color, "#ccccff");
        assert!(roster.team_lookup().values().all(|t| t.member_ids.is_empty()));
    }

    #[test]
    fn admit_is_idempotent_and_requires_introduction() {
        let mut roster = hosted();
        assert!(matches!(
            roster.admit("B"),
            Err(LobbyError::UnknownMember(_))
        ));
        roster.upsert_member("B", "Bob");
        assert!(roster.admit("B").unwrap());
        assert!(!roster.admit("B").unwrap());
        assert_eq!(roster.member_ids(), ["host1".to_string(), "B".to_string()]);
    }

    #[test]
    fn team_moves_keep_membership_derived() {
        let mut roster = hosted();
        for (id, name) in [("B", "Bob"), ("C", "Cleo"), ("D", "Dev")] {
            roster.upsert_member(id, name);
            roster.admit(id).unwrap();
        }
        let moves = [
            ("B", "1"),
            ("C", "1"),
            ("B", "2"),
            ("host1", "2"),
            ("D", "1"),
            ("C", "2"),
            ("C", "2"),
        ];
        for (member, team) in moves {
            roster.set_team(member, team).unwrap();
            assert_derivation_holds(&roster);
        }
        assert_eq!(roster.team("1").unwrap().member_ids, vec!["D".to_string()]);
    }

    #[test]
    fn set_team_rejects_unknown_team_without_change() {
        let mut roster = hosted();
        let before = roster.snapshot();
        assert!(matches!(
            roster.set_team("host1", "9"),
            Err(LobbyError::UnknownTeam(_))
        ));
        assert_eq!(roster.snapshot(), before);
    }

    #[test]
    fn remove_member_updates_lobby_and_teams_but_never_self() {
        let mut roster = hosted();
        roster.upsert_member("B", "Bob");
        roster.admit("B").unwrap();
        roster.set_team("B", "1").unwrap();

        assert!(roster.remove_member("B"));
        assert_eq!(roster.member_ids(), ["host1".to_string()]);
        assert!(roster.team("1").unwrap().member_ids.is_empty());
        assert!(!roster.remove_member("host1"));
    }

    #[test]
    fn snapshot_overwrites_replica_and_rederives_teams() {
        let mut host = hosted();
        host.upsert_member("B", "Bob");
        host.admit("B").unwrap();
        host.set_team("B", "1").unwrap();
        let mut snapshot = host.snapshot();
        // A stale team list in transit must not survive.
        snapshot
            .team_lookup
            .get_mut("2")
            .unwrap()
            .member_ids
            .push("ghost".into());
        snapshot.lobby_member_ids.push("B".into());

        let mut replica = Roster::new(default_teams());
        replica.begin_join("B", "host1", "Bob");
        replica.toggle_ready("B").unwrap();
        replica.apply_snapshot(snapshot);

        assert_eq!(replica.member_ids(), host.member_ids());
        assert!(!replica.member("B").unwrap().is_ready);
        assert_eq!(replica.team("1").unwrap().member_ids, vec!["B".to_string()]);
        assert!(replica.team("2").unwrap().member_ids.is_empty());
    }

    #[test]
    fn view_serializes_ui_field_names() {
        let roster = hosted();
        let view = LobbyView::from_roster(&roster, String::new());
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["myId"], "host1");
        assert_eq!(value["isHosting"], true);
        assert_eq!(value["lobbyMemberIds"], serde_json::json!(["host1"]));
        assert_eq!(value["errorMessage"], "");
        assert_eq!(value["phase"], "HOSTING");
    }
}
