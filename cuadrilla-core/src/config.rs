use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::ledger::XpPolicy;
use crate::member::ChatId;
use crate::scheduler::parse_time_of_day;
use crate::verification::VerificationConfig;

/// Runtime settings shared by every component. Read from the process
/// environment; anything unset or unparsable keeps its default.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// 0 means "not configured": group-only features stay idle.
    pub group_chat_id: ChatId,
    pub inactivity_days: i64,
    pub xp_per_message: u64,
    pub xp_cooldown_secs: i64,
    pub presentation_timeout_minutes: u64,
    pub presentation_grace_minutes: u64,
    pub sweep_time: String,
    pub debate_time: String,
    pub agenda_horizon_days: u32,
    pub lookup_horizon_days: u32,
    pub document_path: PathBuf,
    pub word_game_points: u64,
    /// 0 disables the word game.
    pub word_game_min_gap_minutes: u64,
    pub word_game_max_gap_minutes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            group_chat_id: 0,
            inactivity_days: 30,
            xp_per_message: 20,
            xp_cooldown_secs: 60,
            presentation_timeout_minutes: 10,
            presentation_grace_minutes: 5,
            sweep_time: "04:00".to_string(),
            debate_time: "10:00".to_string(),
            agenda_horizon_days: 14,
            lookup_horizon_days: 30,
            document_path: PathBuf::from("data/info.md"),
            word_game_points: 50,
            word_game_min_gap_minutes: 60,
            word_game_max_gap_minutes: 180,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            data_dir: lookup("CUADRILLA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            group_chat_id: parse_or(&lookup, "GROUP_CHAT_ID", d.group_chat_id),
            inactivity_days: parse_or(&lookup, "INACTIVITY_DAYS", d.inactivity_days).clamp(1, MAX_DAYS),
            xp_per_message: parse_or(&lookup, "XP_PER_MESSAGE", d.xp_per_message),
            xp_cooldown_secs: parse_or(&lookup, "XP_COOLDOWN_SECONDS", d.xp_cooldown_secs).clamp(0, MAX_DAYS * 86_400),
            presentation_timeout_minutes: parse_or(
                &lookup,
                "PRESENTATION_TIMEOUT_MINUTES",
                d.presentation_timeout_minutes,
            ),
            presentation_grace_minutes: parse_or(
                &lookup,
                "PRESENTATION_WARNING_GRACE_MINUTES",
                d.presentation_grace_minutes,
            ),
            sweep_time: time_or(&lookup, "INACTIVITY_SWEEP_TIME", d.sweep_time),
            debate_time: time_or(&lookup, "DEBATE_TIME", d.debate_time),
            agenda_horizon_days: parse_or(&lookup, "AGENDA_HORIZON_DAYS", d.agenda_horizon_days).max(1),
            lookup_horizon_days: parse_or(&lookup, "LOOKUP_HORIZON_DAYS", d.lookup_horizon_days).max(1),
            document_path: lookup("ASSISTANT_DOCUMENT_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.document_path),
            word_game_points: parse_or(&lookup, "WORD_GAME_POINTS", d.word_game_points),
            word_game_min_gap_minutes: parse_or(&lookup, "WORD_GAME_MIN_GAP_MINUTES", d.word_game_min_gap_minutes),
            word_game_max_gap_minutes: parse_or(&lookup, "WORD_GAME_MAX_GAP_MINUTES", d.word_game_max_gap_minutes),
        }
    }

    pub fn agenda_path(&self) -> PathBuf {
        self.data_dir.join("agenda.json")
    }

    pub fn members_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn word_game_path(&self) -> PathBuf {
        self.data_dir.join("word_game.json")
    }

    pub fn debate_path(&self) -> PathBuf {
        self.data_dir.join("debate_state.json")
    }

    pub fn has_group(&self) -> bool {
        self.group_chat_id != 0
    }

    pub fn xp_policy(&self) -> XpPolicy {
        XpPolicy {
            per_grant: self.xp_per_message,
            cooldown: chrono::Duration::seconds(self.xp_cooldown_secs),
        }
    }

    pub fn inactivity_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(self.inactivity_days)
    }

    pub fn verification(&self) -> VerificationConfig {
        VerificationConfig {
            group_id: self.group_chat_id,
            warn_after: minutes(self.presentation_timeout_minutes),
            evict_after_warning: minutes(self.presentation_grace_minutes),
        }
    }

    /// Bounds of the random pause between word game rounds, or `None` when
    /// the game is switched off. A maximum below the minimum is raised to it.
    pub fn word_game_gaps(&self) -> Option<(Duration, Duration)> {
        if self.word_game_min_gap_minutes == 0 {
            return None;
        }
        let min = self.word_game_min_gap_minutes;
        let max = self.word_game_max_gap_minutes.max(min);
        Some((minutes(min), minutes(max)))
    }
}

/// Upper bound for day-based settings, well inside chrono's range.
const MAX_DAYS: i64 = 36_500;

pub(crate) fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match lookup(key) {
        None => default,
        Some(raw) if raw.trim().is_empty() => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key = key, value = %raw, default = %default, "Invalid setting; using default");
            default
        }),
    }
}

fn time_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: String) -> String {
    match lookup(key) {
        Some(raw) if parse_time_of_day(&raw).is_ok() => raw.trim().to_string(),
        Some(raw) => {
            warn!(key = key, value = %raw, default = %default, "Invalid time of day; using default");
            default
        }
        None => default,
    }
}
