//! Per-bot state machine (C5). Grounded on `original_source/bot.go`.
//!
//! §9's design note calls out the Go source's non-portable trick of
//! reaching inside the upstream client object for its raw socket
//! descriptor via pointer arithmetic. This port avoids the problem
//! entirely: the readiness loop (`net::readiness`) owns every socket
//! directly, keyed by bot index, so there is no opaque client object for
//! a bot to reach inside of in the first place — `Bot` only tracks
//! protocol-level state.

use inspectgw_auth::Authenticator;
use std::time::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum BotStatus {
    Disconnected,
    Connected,
    LoggedIn,
    InGame,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub name: String,
    pub password: String,
    pub shared_secret: Option<String>,
}

/// One persistent upstream session. A bot may only issue an inspection
/// while `InGame` (§3's invariant); any fault collapses it straight back to
/// `Disconnected` regardless of which state it faulted from.
pub struct Bot {
    pub credentials: Credentials,
    pub index: usize,
    pub status: BotStatus,
    pub last_inspect: Option<Instant>,

    /// Held only across a login attempt, then zeroed on success per §4.6
    /// ("zero the in-memory credentials and authenticator reference").
    pub(crate) pending_authenticator: Option<Box<dyn Authenticator>>,
}

impl Bot {
    pub fn new(credentials: Credentials, index: usize) -> Bot {
        Bot {
            credentials,
            index,
            status: BotStatus::Disconnected,
            last_inspect: None,
            pending_authenticator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.credentials.name
    }

    /// Tears the bot back down to `Disconnected` and wipes any credentials
    /// held for an in-flight login. Idempotent. The readiness loop is
    /// responsible for dropping the bot's actual socket.
    pub fn reset(&mut self) {
        self.status = BotStatus::Disconnected;
        self.pending_authenticator = None;
    }

    pub fn can_inspect(&self) -> bool {
        self.status == BotStatus::InGame
    }
}

/// The fleet: bots are appended and keep a stable index for their lifetime
/// (used for sticky-proxy assignment and round-robin dispatch), and are
/// only destroyed at process exit (§3).
#[derive(Default)]
pub struct Fleet {
    bots: Vec<Bot>,
}

impl Fleet {
    pub fn new() -> Fleet {
        Fleet { bots: Vec::new() }
    }

    /// Appends a bot, assigning it the next index.
    pub fn add(&mut self, credentials: Credentials) -> usize {
        let index = self.bots.len();
        self.bots.push(Bot::new(credentials, index));
        index
    }

    pub fn get(&self, index: usize) -> Option<&Bot> {
        self.bots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Bot> {
        self.bots.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bot> {
        self.bots.iter()
    }

    /// `[DISCONNECTED, CONNECTED, LOGGED_IN, INGAME, total]`, matching
    /// `GetBotStatus`'s `[5]int` layout (§6).
    pub fn status_counts(&self) -> [usize; 5] {
        let mut counts = [0usize; 5];
        counts[4] = self.bots.len();
        for bot in &self.bots {
            let slot = match bot.status {
                BotStatus::Disconnected => 0,
                BotStatus::Connected => 1,
                BotStatus::LoggedIn => 2,
                BotStatus::InGame => 3,
            };
            counts[slot] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(name: &str) -> Credentials {
        Credentials {
            name: name.to_string(),
            password: "pw".to_string(),
            shared_secret: None,
        }
    }

    #[test]
    fn add_assigns_sequential_indices() {
        let mut fleet = Fleet::new();
        assert_eq!(fleet.add(creds("a")), 0);
        assert_eq!(fleet.add(creds("b")), 1);
        assert_eq!(fleet.len(), 2);
    }

    #[test]
    fn new_bot_cannot_inspect() {
        let bot = Bot::new(creds("a"), 0);
        assert!(!bot.can_inspect());
    }

    #[test]
    fn reset_returns_bot_to_disconnected() {
        let mut bot = Bot::new(creds("a"), 0);
        bot.status = BotStatus::InGame;
        bot.reset();
        assert_eq!(bot.status, BotStatus::Disconnected);
    }

    #[test]
    fn status_counts_tally_each_bucket() {
        let mut fleet = Fleet::new();
        fleet.add(creds("a"));
        fleet.add(creds("b"));
        fleet.get_mut(1).unwrap().status = BotStatus::InGame;

        let counts = fleet.status_counts();
        assert_eq!(counts, [1, 0, 0, 1, 2]);
    }
}
