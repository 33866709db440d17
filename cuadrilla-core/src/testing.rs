//! Recording stand-ins for the platform collaborators. Used by the test
//! suites and by local runs without a chat platform.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::CollaboratorError;
use crate::member::{ChatId, MemberId, MemberRef, MessageId};
use crate::platform::{
    CollaboratorResult, IntroductionJudge, Keyboard, MemberRole, MembershipControl,
    NotificationChannel, TopicSource,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

#[derive(Debug, Default)]
pub struct RecordingChannel {
    next_id: AtomicI64,
    sent: Mutex<Vec<SentMessage>>,
    direct: Mutex<Vec<(MemberId, String)>>,
    pinned: Mutex<Vec<(ChatId, MessageId)>>,
    unpinned: Mutex<Vec<(ChatId, MessageId)>>,
    unreachable: Mutex<HashSet<MemberId>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct messages to `member_id` will fail, as when the member blocked
    /// the bot.
    pub fn block_direct_messages(&self, member_id: MemberId) {
        lock(&self.unreachable).insert(member_id);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, chat_id: ChatId) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| m.text.clone())
            .collect()
    }

    pub fn direct_messages(&self) -> Vec<(MemberId, String)> {
        lock(&self.direct).clone()
    }

    pub fn pinned(&self) -> Vec<(ChatId, MessageId)> {
        lock(&self.pinned).clone()
    }

    pub fn unpinned(&self) -> Vec<(ChatId, MessageId)> {
        lock(&self.unpinned).clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send_direct_message(&self, member_id: MemberId, text: &str) -> CollaboratorResult<()> {
        if lock(&self.unreachable).contains(&member_id) {
            return Err(CollaboratorError::Rejected(format!("member {member_id} blocked the bot")));
        }
        lock(&self.direct).push((member_id, text.to_string()));
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> CollaboratorResult<MessageId> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.sent).push(SentMessage {
            chat_id,
            message_id,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(message_id)
    }

    async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> CollaboratorResult<()> {
        lock(&self.pinned).push((chat_id, message_id));
        Ok(())
    }

    async fn unpin_message(&self, chat_id: ChatId, message_id: MessageId) -> CollaboratorResult<()> {
        lock(&self.unpinned).push((chat_id, message_id));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingMembership {
    removed: Mutex<Vec<MemberId>>,
    unbanned: Mutex<Vec<MemberId>>,
    failing_removals: Mutex<HashSet<MemberId>>,
    roles: Mutex<HashMap<MemberId, MemberRole>>,
}

impl RecordingMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_removal_of(&self, member_id: MemberId, fail: bool) {
        let mut failing = lock(&self.failing_removals);
        if fail {
            failing.insert(member_id);
        } else {
            failing.remove(&member_id);
        }
    }

    pub fn set_role(&self, member_id: MemberId, role: MemberRole) {
        lock(&self.roles).insert(member_id, role);
    }

    pub fn removed(&self) -> Vec<MemberId> {
        lock(&self.removed).clone()
    }

    pub fn unbanned(&self) -> Vec<MemberId> {
        lock(&self.unbanned).clone()
    }
}

#[async_trait]
impl MembershipControl for RecordingMembership {
    async fn remove_member(&self, _group_id: ChatId, member_id: MemberId) -> CollaboratorResult<()> {
        if lock(&self.failing_removals).contains(&member_id) {
            return Err(CollaboratorError::Unavailable("removal refused".to_string()));
        }
        lock(&self.removed).push(member_id);
        Ok(())
    }

    async fn unban_member(&self, _group_id: ChatId, member_id: MemberId) -> CollaboratorResult<()> {
        lock(&self.unbanned).push(member_id);
        Ok(())
    }

    async fn get_member_role(&self, _group_id: ChatId, member_id: MemberId) -> CollaboratorResult<MemberRole> {
        Ok(lock(&self.roles)
            .get(&member_id)
            .copied()
            .unwrap_or(MemberRole::Member))
    }
}

/// Accepts any message containing one of the given words; errors when
/// built with [`KeywordJudge::unavailable`].
#[derive(Debug, Clone)]
pub struct KeywordJudge {
    keywords: Vec<String>,
    available: bool,
}

impl KeywordJudge {
    pub fn new<'a>(keywords: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            available: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            keywords: Vec::new(),
            available: false,
        }
    }
}

#[async_trait]
impl IntroductionJudge for KeywordJudge {
    async fn is_acceptable_introduction(&self, _member: &MemberRef, text: &str) -> CollaboratorResult<bool> {
        if !self.available {
            return Err(CollaboratorError::Unavailable("judge offline".to_string()));
        }
        let lower = text.to_lowercase();
        Ok(self.keywords.iter().any(|k| lower.contains(k)))
    }
}

#[derive(Debug, Clone)]
pub struct FixedTopic(pub Option<String>);

#[async_trait]
impl TopicSource for FixedTopic {
    async fn generate_topic(&self) -> CollaboratorResult<String> {
        self.0
            .clone()
            .ok_or_else(|| CollaboratorError::Unavailable("no topic".to_string()))
    }
}
