//! Single entry point for everything the chat platform delivers.
//!
//! Each intent runs the same fixed sequence:
//! 1. activity tracking,
//! 2. the verification gate,
//! 3. XP grant (group text only),
//! 4. the feature handler: a word game guess in the group, otherwise a
//!    pending plan draft.

use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::agenda::{parse_date, parse_time, AgendaEngine, DayAgenda, Event, Registration, Withdrawal, DATE_FORMAT};
use crate::debate::DebateManager;
use crate::error::CoreError;
use crate::ledger::{EngagementLedger, LevelUpEvent, ProgressView};
use crate::member::{ChatId, MemberId, MemberRef};
use crate::platform::{Assistant, Button, Keyboard};
use crate::verification::{Gate, VerificationMachine};
use crate::word_game::WordGame;

const PROGRESS_BLOCKS: usize = 10;
const FIRST_SLOT: (u32, u32) = (8, 0);
const LAST_SLOT: (u32, u32) = (22, 30);
const DRAFT_TTL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

// --- 1. Intents & Replies ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatContext {
    pub chat_id: ChatId,
    pub kind: ChatKind,
}

impl ChatContext {
    pub fn private(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            kind: ChatKind::Private,
        }
    }

    pub fn group(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            kind: ChatKind::Group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Command {
        chat: ChatContext,
        member: MemberRef,
        name: String,
        args: String,
    },
    Button {
        chat: ChatContext,
        member: MemberRef,
        payload: String,
    },
    Text {
        chat: ChatContext,
        member: MemberRef,
        text: String,
    },
    MemberJoined {
        chat: ChatContext,
        member: MemberRef,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub chat_id: ChatId,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

impl Reply {
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            keyboard: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

// --- 2. Button payloads ---

/// Parsed `verb|arg|arg` button payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    Menu,
    View,
    Create,
    PickDate(NaiveDate),
    PickTime(String),
    JoinMenu,
    LeaveMenu,
    DeleteMenu,
    Join(NaiveDate, usize),
    Leave(NaiveDate, usize),
    Delete(NaiveDate, usize),
}

impl FromStr for ButtonAction {
    type Err = CoreError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = payload.split('|').collect();
        let bad = || CoreError::invalid(format!("unrecognised button payload '{payload}'"));
        let event_ref = |parts: &[&str]| -> Result<(NaiveDate, usize), CoreError> {
            match parts {
                [date, index] => {
                    let index = index.parse().map_err(|_| bad())?;
                    Ok((parse_date(date)?, index))
                }
                _ => Err(bad()),
            }
        };

        match parts.as_slice() {
            ["menu"] => Ok(Self::Menu),
            ["view"] => Ok(Self::View),
            ["create"] => Ok(Self::Create),
            ["date", date] => Ok(Self::PickDate(parse_date(date)?)),
            ["time", time] => {
                parse_time(time)?;
                Ok(Self::PickTime(time.to_string()))
            }
            ["join_menu"] => Ok(Self::JoinMenu),
            ["leave_menu"] => Ok(Self::LeaveMenu),
            ["delete_menu"] => Ok(Self::DeleteMenu),
            ["join", rest @ ..] => event_ref(rest).map(|(d, i)| Self::Join(d, i)),
            ["leave", rest @ ..] => event_ref(rest).map(|(d, i)| Self::Leave(d, i)),
            ["delete", rest @ ..] => event_ref(rest).map(|(d, i)| Self::Delete(d, i)),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for ButtonAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = |d: &NaiveDate| d.format(DATE_FORMAT).to_string();
        match self {
            Self::Menu => write!(f, "menu"),
            Self::View => write!(f, "view"),
            Self::Create => write!(f, "create"),
            Self::PickDate(d) => write!(f, "date|{}", date(d)),
            Self::PickTime(t) => write!(f, "time|{t}"),
            Self::JoinMenu => write!(f, "join_menu"),
            Self::LeaveMenu => write!(f, "leave_menu"),
            Self::DeleteMenu => write!(f, "delete_menu"),
            Self::Join(d, i) => write!(f, "join|{}|{i}", date(d)),
            Self::Leave(d, i) => write!(f, "leave|{}|{i}", date(d)),
            Self::Delete(d, i) => write!(f, "delete|{}|{i}", date(d)),
        }
    }
}

fn button(label: impl Into<String>, action: ButtonAction) -> Button {
    Button::new(label, action.to_string())
}

// --- 3. Dispatcher ---

/// A plan being created through the wizard. Only a text message in the
/// chat where it was started, before it goes stale, can complete it.
#[derive(Debug, Clone)]
struct Draft {
    chat_id: ChatId,
    date: NaiveDate,
    time: Option<String>,
    touched: Instant,
}

impl Draft {
    fn is_stale(&self) -> bool {
        self.touched.elapsed() > DRAFT_TTL
    }
}

pub struct Dispatcher {
    agenda: Arc<AgendaEngine>,
    ledger: Arc<EngagementLedger>,
    verification: Arc<VerificationMachine>,
    debate: Arc<DebateManager>,
    word_game: Arc<WordGame>,
    assistant: Arc<dyn Assistant>,
    group_id: ChatId,
    drafts: Mutex<HashMap<MemberId, Draft>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("group_id", &self.group_id)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        agenda: Arc<AgendaEngine>,
        ledger: Arc<EngagementLedger>,
        verification: Arc<VerificationMachine>,
        debate: Arc<DebateManager>,
        word_game: Arc<WordGame>,
        assistant: Arc<dyn Assistant>,
        group_id: ChatId,
    ) -> Self {
        Self {
            agenda,
            ledger,
            verification,
            debate,
            word_game,
            assistant,
            group_id,
            drafts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(&self, intent: Intent) -> Vec<Reply> {
        match intent {
            Intent::MemberJoined { chat, member } => self.on_join(chat, member).await,
            Intent::Text { chat, member, text } => self.on_text(chat, member, text).await,
            Intent::Command {
                chat,
                member,
                name,
                args,
            } => {
                self.track(&member).await;
                if let Some(blocked) = self.gate_feature(chat, &member).await {
                    return vec![blocked];
                }
                self.on_command(chat, &member, &name, args.trim()).await
            }
            Intent::Button {
                chat,
                member,
                payload,
            } => {
                self.track(&member).await;
                if let Some(blocked) = self.gate_feature(chat, &member).await {
                    return vec![blocked];
                }
                match payload.parse::<ButtonAction>() {
                    Ok(action) => self.on_button(chat, &member, action).await,
                    Err(e) => {
                        warn!(member_id = member.id, payload = %payload, error = %e, "Ignoring unknown button");
                        vec![Reply::text(chat.chat_id, "That button has expired. Try /agenda again.")]
                    }
                }
            }
        }
    }

    // --- Pipeline steps ---

    async fn track(&self, member: &MemberRef) {
        if let Err(e) = self.ledger.touch_activity(member).await {
            error!(member_id = member.id, error = %e, "Failed to record activity");
        }
    }

    /// Commands and buttons are closed to members who still owe an
    /// introduction.
    async fn gate_feature(&self, chat: ChatContext, member: &MemberRef) -> Option<Reply> {
        if self.ledger.get_status(member.id).await.needs_introduction() {
            debug!(member_id = member.id, "Feature blocked pending introduction");
            return Some(Reply::text(
                chat.chat_id,
                "Please introduce yourself in the group first, then I'm all yours!",
            ));
        }
        None
    }

    async fn on_join(&self, chat: ChatContext, member: MemberRef) -> Vec<Reply> {
        if chat.chat_id != self.group_id {
            return Vec::new();
        }
        if let Err(e) = self.verification.on_member_joined(&member).await {
            error!(member_id = member.id, error = %e, "Could not start verification");
            return Vec::new();
        }
        let minutes = self.verification.config().warn_after.as_secs().div_ceil(60);
        vec![Reply::text(
            chat.chat_id,
            format!(
                "Welcome {}! Please introduce yourself within {minutes} minutes: who you are, where you're from and what plans you enjoy.",
                member.mention()
            ),
        )]
    }

    async fn on_text(&self, chat: ChatContext, member: MemberRef, text: String) -> Vec<Reply> {
        self.track(&member).await;

        let mut replies = Vec::new();
        if chat.kind == ChatKind::Group {
            match self.verification.screen_message(&member, &text).await {
                Ok(Gate::Open) => {}
                Ok(Gate::JustVerified) => {
                    return vec![Reply::text(
                        chat.chat_id,
                        format!("Thanks {}, welcome to the group!", member.display_name),
                    )];
                }
                Ok(Gate::AwaitingIntroduction) => return Vec::new(),
                Err(e) => {
                    error!(member_id = member.id, error = %e, "Verification gate failed");
                    return Vec::new();
                }
            }

            match self.ledger.grant_xp_if_eligible(member.id).await {
                Ok(Some(level_up)) => replies.push(Reply::text(chat.chat_id, level_up_message(&level_up))),
                Ok(None) => {}
                Err(e) => error!(member_id = member.id, error = %e, "XP grant failed"),
            }

            if let Some(won) = self.word_game_guess(chat, &member, &text).await {
                replies.extend(won);
                return replies;
            }
        } else if self.ledger.get_status(member.id).await.needs_introduction() {
            return Vec::new();
        }

        if let Some(reply) = self.complete_draft(chat, &member, &text).await {
            replies.push(reply);
        }
        replies
    }

    async fn on_command(&self, chat: ChatContext, member: &MemberRef, name: &str, args: &str) -> Vec<Reply> {
        info!(member_id = member.id, command = name, "Command");
        match name {
            "start" | "help" => vec![Reply::text(
                chat.chat_id,
                "Hi! I keep the group's agenda, track levels and run the daily debate.\n\n/agenda - browse and manage plans\n/ia <question> - ask the assistant\n/nivel - your level and XP",
            )
            .with_keyboard(main_menu())],
            "agenda" => vec![Reply::text(chat.chat_id, "What would you like to do?").with_keyboard(main_menu())],
            "ia" | "ask" => vec![self.ask_assistant(chat, member, args).await],
            "nivel" | "level" => vec![self.progress(chat, member).await],
            "debate" => match self.debate.force_debate(chat.chat_id, member.id).await {
                Ok(_) => Vec::new(),
                Err(e) => vec![Reply::text(chat.chat_id, failure_text(&e))],
            },
            _ => vec![Reply::text(chat.chat_id, "I don't know that command. Try /start.")],
        }
    }

    async fn on_button(&self, chat: ChatContext, member: &MemberRef, action: ButtonAction) -> Vec<Reply> {
        debug!(member_id = member.id, action = %action, "Button");
        let reply = match action {
            ButtonAction::Menu => Reply::text(chat.chat_id, "What would you like to do?").with_keyboard(main_menu()),
            ButtonAction::View => {
                let days = self.agenda.list_active_events(None, None).await;
                Reply::text(chat.chat_id, render_agenda(&days)).with_keyboard(back_row())
            }
            ButtonAction::Create => Reply::text(chat.chat_id, "Which day?").with_keyboard(self.date_picker()),
            ButtonAction::PickDate(date) => {
                let mut drafts = self.drafts.lock().await;
                drafts.retain(|_, d| !d.is_stale());
                drafts.insert(
                    member.id,
                    Draft {
                        chat_id: chat.chat_id,
                        date,
                        time: None,
                        touched: Instant::now(),
                    },
                );
                Reply::text(chat.chat_id, format!("{}: what time?", pretty_date(date)))
                    .with_keyboard(time_picker())
            }
            ButtonAction::PickTime(time) => {
                let mut drafts = self.drafts.lock().await;
                match drafts.get_mut(&member.id).filter(|d| !d.is_stale()) {
                    Some(draft) => {
                        draft.chat_id = chat.chat_id;
                        draft.time = Some(time.clone());
                        draft.touched = Instant::now();
                        Reply::text(
                            chat.chat_id,
                            format!("{} at {time}. Now send me the title of the plan.", pretty_date(draft.date)),
                        )
                    }
                    None => Reply::text(chat.chat_id, "Pick a day first.").with_keyboard(self.date_picker()),
                }
            }
            ButtonAction::JoinMenu => {
                let days = self.agenda.list_active_events(None, None).await;
                let member_id = member.id;
                let rows: Keyboard = days
                    .iter()
                    .flat_map(|day| {
                        day.events
                            .iter()
                            .filter(move |(_, e)| !e.has_attendee(member_id))
                            .map(move |(i, e)| vec![button(event_label(day.date, e), ButtonAction::Join(day.date, *i))])
                    })
                    .collect();
                menu_or_empty(chat.chat_id, "Which plan do you want to join?", "There's nothing new to join right now.", rows)
            }
            ButtonAction::LeaveMenu => {
                let listings = self.agenda.list_events_for_attendee(member.id, None).await;
                let rows: Keyboard = listings
                    .iter()
                    .map(|l| vec![button(event_label(l.date, &l.event), ButtonAction::Leave(l.date, l.index))])
                    .collect();
                menu_or_empty(chat.chat_id, "Which plan do you want to leave?", "You're not signed up for anything.", rows)
            }
            ButtonAction::DeleteMenu => {
                let listings = self.agenda.list_events_for_creator(member.id, None).await;
                let rows: Keyboard = listings
                    .iter()
                    .map(|l| vec![button(event_label(l.date, &l.event), ButtonAction::Delete(l.date, l.index))])
                    .collect();
                menu_or_empty(chat.chat_id, "Which of your plans do you want to delete?", "You haven't created any upcoming plans.", rows)
            }
            ButtonAction::Join(date, index) => {
                let outcome = self.agenda.register_attendee(date, index, member).await;
                let title = self.title_of(date, index).await;
                match outcome {
                    Ok(Registration::Registered) => Reply::text(chat.chat_id, format!("You're in for {title}!")),
                    Ok(Registration::AlreadyRegistered) => {
                        Reply::text(chat.chat_id, format!("You're already signed up for {title}."))
                    }
                    Err(e) => Reply::text(chat.chat_id, failure_text(&e)),
                }
            }
            ButtonAction::Leave(date, index) => {
                let outcome = self.agenda.unregister_attendee(date, index, member.id).await;
                let title = self.title_of(date, index).await;
                match outcome {
                    Ok(Withdrawal::Removed) => Reply::text(chat.chat_id, format!("You left {title}.")),
                    Ok(Withdrawal::NotRegistered) => {
                        Reply::text(chat.chat_id, format!("You weren't signed up for {title}."))
                    }
                    Err(e) => Reply::text(chat.chat_id, failure_text(&e)),
                }
            }
            ButtonAction::Delete(date, index) => {
                match self.agenda.deactivate_owned_event(date, index, member.id).await {
                    Ok(event) => Reply::text(chat.chat_id, format!("Deleted \"{}\".", event.title)),
                    Err(e) => Reply::text(chat.chat_id, failure_text(&e)),
                }
            }
        };
        vec![reply]
    }

    // --- Feature helpers ---

    /// Awards the open word game round to `member` if `text` is the word.
    async fn word_game_guess(&self, chat: ChatContext, member: &MemberRef, text: &str) -> Option<Vec<Reply>> {
        let word = match self.word_game.claim_guess(text).await {
            Ok(word) => word?,
            Err(e) => {
                error!(member_id = member.id, error = %e, "Word game guess not recorded");
                return None;
            }
        };

        let points = self.word_game.points();
        info!(member_id = member.id, word = %word, "Word game won");
        match self.ledger.add_points(member, points).await {
            Ok((total, level_up)) => {
                let mut replies = vec![Reply::text(
                    chat.chat_id,
                    format!(
                        "{} guessed the word '{word}'!
+{points} points. Total: {total}",
                        member.display_name
                    ),
                )];
                if let Some(level_up) = level_up {
                    replies.push(Reply::text(chat.chat_id, level_up_message(&level_up)));
                }
                Some(replies)
            }
            Err(e) => {
                error!(member_id = member.id, error = %e, "Word game points not saved");
                Some(vec![Reply::text(
                    chat.chat_id,
                    format!(
                        "{} guessed the word '{word}'! I couldn't save the points this time, sorry.",
                        member.display_name
                    ),
                )])
            }
        }
    }

    async fn complete_draft(&self, chat: ChatContext, member: &MemberRef, text: &str) -> Option<Reply> {
        let draft = {
            let mut drafts = self.drafts.lock().await;
            if drafts.get(&member.id).is_some_and(Draft::is_stale) {
                debug!(member_id = member.id, "Dropping stale plan draft");
                drafts.remove(&member.id);
            }
            drafts.get(&member.id).cloned()
        }?;
        if draft.chat_id != chat.chat_id {
            return None;
        }
        let time = draft.time?;

        let date = draft.date.format(DATE_FORMAT).to_string();
        match self.agenda.create_event(&date, &time, text, member.id).await {
            Ok(_) => {
                self.drafts.lock().await.remove(&member.id);
                Some(
                    Reply::text(
                        chat.chat_id,
                        format!("Plan created: {} at {time}, \"{}\".", pretty_date(draft.date), text.trim()),
                    )
                    .with_keyboard(back_row()),
                )
            }
            Err(e) => Some(Reply::text(chat.chat_id, failure_text(&e))),
        }
    }

    async fn ask_assistant(&self, chat: ChatContext, member: &MemberRef, prompt: &str) -> Reply {
        if prompt.is_empty() {
            return Reply::text(chat.chat_id, "Ask me something, e.g. /ia what's on this weekend?");
        }
        match self.assistant.respond(member, prompt).await {
            Ok(answer) => Reply::text(chat.chat_id, answer),
            Err(e) => {
                warn!(member_id = member.id, error = %e, "Assistant failed");
                Reply::text(chat.chat_id, "The assistant is unavailable right now. Try again in a bit.")
            }
        }
    }

    async fn progress(&self, chat: ChatContext, member: &MemberRef) -> Reply {
        match self.ledger.get_progress(member.id).await {
            Some(view) => Reply::text(chat.chat_id, render_progress(&view)),
            None => Reply::text(chat.chat_id, "I haven't seen you around yet. Say hi in the group!"),
        }
    }

    async fn title_of(&self, date: NaiveDate, index: usize) -> String {
        self.agenda
            .get_event(date, index)
            .await
            .map(|e| format!("\"{}\"", e.title))
            .unwrap_or_else(|_| "that plan".to_string())
    }

    fn date_picker(&self) -> Keyboard {
        let today = self.agenda.today();
        let buttons: Vec<Button> = (0..self.agenda.window_days())
            .map(|offset| {
                let date = today + Duration::days(i64::from(offset));
                button(pretty_date(date), ButtonAction::PickDate(date))
            })
            .collect();
        let mut rows: Keyboard = buttons.chunks(2).map(|c| c.to_vec()).collect();
        rows.push(back_row().remove(0));
        rows
    }
}

// --- 4. Rendering ---

fn main_menu() -> Keyboard {
    vec![
        vec![button("See plans", ButtonAction::View), button("Create plan", ButtonAction::Create)],
        vec![button("Join a plan", ButtonAction::JoinMenu), button("Leave a plan", ButtonAction::LeaveMenu)],
        vec![button("Delete my plan", ButtonAction::DeleteMenu)],
    ]
}

fn back_row() -> Keyboard {
    vec![vec![button("Back", ButtonAction::Menu)]]
}

fn time_picker() -> Keyboard {
    let mut slots = Vec::new();
    let mut slot = NaiveTime::from_hms_opt(FIRST_SLOT.0, FIRST_SLOT.1, 0);
    let last = NaiveTime::from_hms_opt(LAST_SLOT.0, LAST_SLOT.1, 0);
    while let (Some(t), Some(end)) = (slot, last) {
        if t > end {
            break;
        }
        let label = t.format("%H:%M").to_string();
        slots.push(button(label.clone(), ButtonAction::PickTime(label)));
        slot = t.overflowing_add_signed(Duration::minutes(30)).0.into();
    }
    slots.chunks(4).map(|c| c.to_vec()).collect()
}

fn menu_or_empty(chat_id: ChatId, prompt: &str, empty: &str, mut rows: Keyboard) -> Reply {
    if rows.is_empty() {
        return Reply::text(chat_id, empty).with_keyboard(back_row());
    }
    rows.extend(back_row());
    Reply::text(chat_id, prompt).with_keyboard(rows)
}

fn pretty_date(date: NaiveDate) -> String {
    format!("{} {:02}/{:02}", date.weekday(), date.day(), date.month())
}

fn event_label(date: NaiveDate, event: &Event) -> String {
    format!("{} {} {}", pretty_date(date), event.time, event.title)
}

pub fn render_agenda(days: &[DayAgenda]) -> String {
    if days.is_empty() {
        return "No plans in the next two weeks. Create one!".to_string();
    }
    let mut out = String::from("Upcoming plans:\n");
    for day in days {
        out.push_str(&format!("\n{}\n", pretty_date(day.date)));
        let mut events: Vec<&(usize, Event)> = day.events.iter().collect();
        events.sort_by(|a, b| a.1.time.cmp(&b.1.time));
        for (_, e) in events {
            out.push_str(&format!("  • {} {} ({} going)\n", e.time, e.title, e.attendees.len()));
        }
    }
    out
}

pub fn render_progress(view: &ProgressView) -> String {
    let filled = ((view.ratio() * PROGRESS_BLOCKS as f64).round() as usize).min(PROGRESS_BLOCKS);
    let bar = format!("{}{}", "▓".repeat(filled), "░".repeat(PROGRESS_BLOCKS - filled));
    let xp_line = match view.next_level_xp {
        Some(next) => format!("XP: {} / {next}", view.xp),
        None => format!("XP: {} (top level reached)", view.xp),
    };
    format!(
        "{}\nLevel {}: {}\n{bar}\n{xp_line}\nLives: {}",
        view.member.display_name, view.level, view.level_name, view.lives
    )
}

fn level_up_message(ev: &LevelUpEvent) -> String {
    format!(
        "{} just reached level {}: {}!",
        ev.member.mention(),
        ev.new_level,
        ev.level_name
    )
}

fn failure_text(err: &CoreError) -> String {
    match err {
        CoreError::NotFound(_) => "I couldn't find that plan.".to_string(),
        CoreError::InvalidArgument(msg) => format!("That doesn't look right: {msg}"),
        CoreError::Forbidden(msg) => format!("Sorry, {msg}."),
        CoreError::Persistence { .. } => {
            error!(error = %err, "Write failed while serving a request");
            "Something went wrong saving that. Please try again.".to_string()
        }
        CoreError::Collaborator(_) => "A service I depend on is unavailable right now.".to_string(),
        CoreError::Schedule(_) => "Something went wrong.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_payloads_parse() {
        let d = NaiveDate::from_ymd_opt(2025, 12, 24).unwrap();
        assert_eq!("view".parse::<ButtonAction>().unwrap(), ButtonAction::View);
        assert_eq!("date|2025-12-24".parse::<ButtonAction>().unwrap(), ButtonAction::PickDate(d));
        assert_eq!("join|2025-12-24|3".parse::<ButtonAction>().unwrap(), ButtonAction::Join(d, 3));
        assert_eq!(
            "time|20:30".parse::<ButtonAction>().unwrap(),
            ButtonAction::PickTime("20:30".to_string())
        );
        for bad in ["", "join|2025-12-24", "join|2025-12-24|x", "date|24-12-2025", "time|25:00", "dance"] {
            assert!(bad.parse::<ButtonAction>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn button_payloads_display_as_they_parse() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let action = ButtonAction::Delete(d, 7);
        assert_eq!(action.to_string(), "delete|2026-01-02|7");
        assert_eq!(action.to_string().parse::<ButtonAction>().unwrap(), action);
    }

    #[test]
    fn time_picker_covers_evening() {
        let labels: Vec<String> = time_picker()
            .into_iter()
            .flatten()
            .map(|b| b.label)
            .collect();
        assert_eq!(labels.first().map(String::as_str), Some("08:00"));
        assert_eq!(labels.last().map(String::as_str), Some("22:30"));
        assert_eq!(labels.len(), 30);
    }

    #[test]
    fn progress_bar_renders_maxed_and_partial() {
        let member = MemberRef::new(1, "Ana");
        let partial = ProgressView {
            member: member.clone(),
            level: 2,
            level_name: "Regular".into(),
            xp: 401,
            level_floor_xp: 283,
            next_level_xp: Some(520),
            lives: 3,
        };
        let text = render_progress(&partial);
        assert!(text.contains("▓▓▓▓▓░░░░░"));
        assert!(text.contains("XP: 401 / 520"));

        let maxed = ProgressView {
            next_level_xp: None,
            xp: 50_000,
            ..partial
        };
        assert!(render_progress(&maxed).contains("▓▓▓▓▓▓▓▓▓▓"));
        assert!(render_progress(&maxed).contains("top level"));
    }
}
