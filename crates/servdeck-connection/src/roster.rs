use servdeck_core::PlayerInfo;

/// Connected players in arrival order, unique by login.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Roster {
    players: Vec<PlayerInfo>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a full listing. Later duplicates merge into the first entry.
    pub fn from_players(players: impl IntoIterator<Item = PlayerInfo>) -> Self {
        let mut roster = Self::new();
        for p in players {
            roster.upsert(p);
        }
        roster
    }

    /// Merge into the existing entry for the login, or append. Returns the
    /// entry as stored.
    pub fn upsert(&mut self, player: PlayerInfo) -> PlayerInfo {
        match self.players.iter_mut().find(|p| p.login == player.login) {
            Some(existing) => {
                existing.merge_from(&player);
                existing.clone()
            }
            None => {
                self.players.push(player.clone());
                player
            }
        }
    }

    /// Merge into an existing entry only. Info for a login that is not
    /// connected (a late update racing its disconnect) is dropped.
    pub fn merge(&mut self, player: &PlayerInfo) -> Option<PlayerInfo> {
        let existing = self.players.iter_mut().find(|p| p.login == player.login)?;
        existing.merge_from(player);
        Some(existing.clone())
    }

    /// Absent logins are a no-op. Returns whether an entry was removed.
    pub fn remove(&mut self, login: &str) -> bool {
        let before = self.players.len();
        self.players.retain(|p| p.login != login);
        self.players.len() != before
    }

    pub fn get(&self, login: &str) -> Option<&PlayerInfo> {
        self.players.iter().find(|p| p.login == login)
    }

    pub fn players(&self) -> &[PlayerInfo] {
        &self.players
    }

    pub fn to_vec(&self) -> Vec<PlayerInfo> {
        self.players.clone()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
