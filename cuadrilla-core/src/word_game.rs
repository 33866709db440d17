//! Word game: every so often a word is posted to the group and the first
//! member to type it back wins bonus points. At most one round is open at a
//! time and each round has exactly one winner.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::CoreResult;
use crate::member::{ChatId, MessageId};
use crate::platform::NotificationChannel;
use crate::store::{Change, Collection, RecordStore};

const WORDS: &[&str] = &[
    "rioja", "vino", "amigo", "fiesta", "pintxo", "botella", "musica", "cuadrilla", "tardeo", "verano",
    "invierno", "montana", "playa", "chuleton", "torneo", "cafe", "helado", "parque", "futbol", "pelota",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordGameState {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub current_word: Option<String>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default, deserialize_with = "crate::ledger::timestamp::optional")]
    pub last_started_at: Option<DateTime<Utc>>,
}

impl WordGameState {
    /// The word of the open round. A round flagged active without a word is
    /// treated as closed.
    pub fn open_word(&self) -> Option<&str> {
        if self.active {
            self.current_word.as_deref()
        } else {
            None
        }
    }

    fn close(&mut self) {
        self.active = false;
        self.current_word = None;
        self.last_started_at = None;
    }
}

pub struct WordGame {
    state: Collection<WordGameState>,
    notifier: Arc<dyn NotificationChannel>,
    group_id: ChatId,
    points: u64,
}

impl std::fmt::Debug for WordGame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WordGame")
            .field("state", &self.state)
            .field("group_id", &self.group_id)
            .field("points", &self.points)
            .finish()
    }
}

impl WordGame {
    pub async fn open(
        store: Arc<dyn RecordStore<WordGameState>>,
        notifier: Arc<dyn NotificationChannel>,
        group_id: ChatId,
        points: u64,
    ) -> Self {
        Self {
            state: Collection::open("word_game", store).await,
            notifier,
            group_id,
            points,
        }
    }

    /// Points awarded to a round's winner.
    pub fn points(&self) -> u64 {
        self.points
    }

    pub async fn current(&self) -> WordGameState {
        self.state.snapshot().await
    }

    /// Posts a new word to the group unless a round is already open.
    /// Returns the word when a round started.
    pub async fn start_round(&self) -> CoreResult<Option<String>> {
        if self.group_id == 0 {
            warn!("GROUP_CHAT_ID not set; word game round skipped");
            return Ok(None);
        }
        if self.state.read(|s| s.open_word().is_some()).await {
            info!("Word game round still open; not starting another");
            return Ok(None);
        }

        let word = pick_word();
        let text = format!(
            "Word game!\nFirst to type this word wins {} points:\n\n{word}",
            self.points
        );
        let message_id = self.notifier.send_message(self.group_id, &text, None).await?;

        let now = Utc::now();
        self.state
            .update(|s| {
                s.active = true;
                s.current_word = Some(word.clone());
                s.last_message_id = Some(message_id);
                s.last_started_at = Some(now);
                Ok(Change::Commit(()))
            })
            .await?;

        info!(message_id = message_id, word = %word, "Word game round started");
        Ok(Some(word))
    }

    /// Closes the open round if `text` matches its word and returns the
    /// word. Concurrent correct guesses see exactly one winner.
    pub async fn claim_guess(&self, text: &str) -> CoreResult<Option<String>> {
        let guess = normalize_guess(text);
        if guess.is_empty() {
            return Ok(None);
        }
        let matches = |s: &WordGameState| s.open_word().is_some_and(|w| normalize_guess(w) == guess);
        if !self.state.read(matches).await {
            return Ok(None);
        }

        self.state
            .update(|s| {
                if !matches(s) {
                    return Ok(Change::Unchanged(None));
                }
                let word = s.current_word.take();
                s.close();
                Ok(Change::Commit(word))
            })
            .await
    }

    /// Closes the open round without a winner. Returns whether one was open.
    pub async fn finish_round(&self) -> CoreResult<bool> {
        let closed = self
            .state
            .update(|s| {
                if !s.active {
                    return Ok(Change::Unchanged(false));
                }
                s.close();
                Ok(Change::Commit(true))
            })
            .await?;
        if closed {
            debug!("Word game round closed without a winner");
        }
        Ok(closed)
    }
}

/// Lowercases and keeps only letters (Spanish accents included) and digits.
pub fn normalize_guess(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "ñáéíóúü".contains(*c))
        .collect()
}

fn pick_word() -> String {
    WORDS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("cuadrilla")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::store::MemoryStore;
    use crate::testing::RecordingChannel;

    const GROUP: ChatId = -42;

    async fn game(group_id: ChatId) -> (WordGame, Arc<RecordingChannel>, Arc<MemoryStore<WordGameState>>) {
        let channel = Arc::new(RecordingChannel::new());
        let store = Arc::new(MemoryStore::new(WordGameState::default()));
        let game = WordGame::open(store.clone(), channel.clone(), group_id, 50).await;
        (game, channel, store)
    }

    #[test]
    fn guesses_are_normalized() {
        assert_eq!(normalize_guess("  Chuletón!! "), "chuletón");
        assert_eq!(normalize_guess("Tar-deo 2"), "tardeo2");
        assert_eq!(normalize_guess("🍷"), "");
    }

    #[tokio::test]
    async fn round_posts_a_known_word_once() {
        let (game, channel, _) = game(GROUP).await;
        let word = game.start_round().await.unwrap().unwrap();
        assert!(WORDS.contains(&word.as_str()));

        let posted = channel.sent_to(GROUP);
        assert_eq!(posted.len(), 1);
        assert!(posted[0].contains(&word));
        assert!(posted[0].contains("50 points"));

        let state = game.current().await;
        assert_eq!(state.open_word(), Some(word.as_str()));
        assert_eq!(state.last_message_id, Some(1));
        assert!(state.last_started_at.is_some());

        assert_eq!(game.start_round().await.unwrap(), None);
        assert_eq!(channel.sent_to(GROUP).len(), 1);
    }

    #[tokio::test]
    async fn first_correct_guess_wins_and_closes_the_round() {
        let (game, _, _) = game(GROUP).await;
        let word = game.start_round().await.unwrap().unwrap();

        assert_eq!(game.claim_guess("definitely not it").await.unwrap(), None);
        let shouted = format!("  {}! ", word.to_uppercase());
        assert_eq!(game.claim_guess(&shouted).await.unwrap(), Some(word.clone()));
        assert_eq!(game.claim_guess(&word).await.unwrap(), None);

        let state = game.current().await;
        assert!(!state.active);
        assert_eq!(state.current_word, None);
    }

    #[tokio::test]
    async fn no_group_means_no_rounds() {
        let (game, channel, _) = game(0).await;
        assert_eq!(game.start_round().await.unwrap(), None);
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_close_keeps_the_round_open() {
        let (game, _, store) = game(GROUP).await;
        let word = game.start_round().await.unwrap().unwrap();

        store.set_fail_writes(true);
        assert!(matches!(game.claim_guess(&word).await, Err(CoreError::Persistence { .. })));
        store.set_fail_writes(false);

        assert_eq!(game.claim_guess(&word).await.unwrap(), Some(word));
        assert!(!game.finish_round().await.unwrap());
    }

    #[tokio::test]
    async fn first_generation_state_loads() {
        let raw = r#"{"active": true, "current_word": "vino", "last_message_id": 77,
                      "last_started_at": "2025-11-02T18:30:00.123456"}"#;
        let state: WordGameState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.open_word(), Some("vino"));
        assert_eq!(state.last_message_id, Some(77));
        assert_eq!(state.last_started_at.unwrap().to_rfc3339(), "2025-11-02T18:30:00.123456+00:00");
    }
}
