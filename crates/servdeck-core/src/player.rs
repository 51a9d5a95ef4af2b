use serde::{Deserialize, Serialize};

/// A connected player as reported by the remote server.
///
/// Serialized camelCase; deserialization also accepts the server's
/// PascalCase field names so raw `GetPlayerInfo` results parse directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    #[serde(alias = "Login")]
    pub login: String,
    #[serde(alias = "NickName", default)]
    pub nick_name: String,
    #[serde(alias = "PlayerId", default)]
    pub player_id: i64,
    #[serde(alias = "SpectatorStatus", default)]
    pub spectator_status: i64,
    #[serde(alias = "TeamId", default = "no_team")]
    pub team_id: i64,
}

fn no_team() -> i64 {
    -1
}

impl PlayerInfo {
    /// Minimal entry for a login whose details are not known yet.
    pub fn bare(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            nick_name: String::new(),
            player_id: 0,
            spectator_status: 0,
            team_id: no_team(),
        }
    }

    /// Overwrite fields with a newer report for the same login.
    ///
    /// Empty nicknames from partial reports do not erase a known one.
    pub fn merge_from(&mut self, newer: &PlayerInfo) {
        debug_assert_eq!(self.login, newer.login);
        if !newer.nick_name.is_empty() {
            self.nick_name = newer.nick_name.clone();
        }
        self.player_id = newer.player_id;
        self.spectator_status = newer.spectator_status;
        self.team_id = newer.team_id;
    }

    pub fn is_spectator(&self) -> bool {
        // Units digit of SpectatorStatus is the spectator flag.
        self.spectator_status % 10 != 0
    }
}
