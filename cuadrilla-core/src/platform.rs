//! Seams to the outside world. The chat platform and the language model
//! implement these; the core only ever talks through them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::member::{ChatId, MemberId, MemberRef, MessageId};

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Administrator,
    Member,
    Restricted,
    Left,
    Banned,
}

impl MemberRole {
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Owner | Self::Administrator)
    }
}

/// Inline button attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

impl Button {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: payload.into(),
        }
    }
}

/// Rows of buttons.
pub type Keyboard = Vec<Vec<Button>>;

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Private message to a member. Callers treat failure as non-fatal.
    async fn send_direct_message(&self, member_id: MemberId, text: &str) -> CollaboratorResult<()>;

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> CollaboratorResult<MessageId>;

    async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> CollaboratorResult<()>;

    async fn unpin_message(&self, chat_id: ChatId, message_id: MessageId) -> CollaboratorResult<()>;
}

#[async_trait]
pub trait MembershipControl: Send + Sync {
    async fn remove_member(&self, group_id: ChatId, member_id: MemberId) -> CollaboratorResult<()>;

    async fn unban_member(&self, group_id: ChatId, member_id: MemberId) -> CollaboratorResult<()>;

    async fn get_member_role(&self, group_id: ChatId, member_id: MemberId) -> CollaboratorResult<MemberRole>;
}

/// Decides whether a newcomer's message counts as an introduction.
#[async_trait]
pub trait IntroductionJudge: Send + Sync {
    async fn is_acceptable_introduction(&self, member: &MemberRef, text: &str) -> CollaboratorResult<bool>;
}

/// Produces the daily discussion prompt.
#[async_trait]
pub trait TopicSource: Send + Sync {
    async fn generate_topic(&self) -> CollaboratorResult<String>;
}

/// Free-form question answering with access to the agenda tools.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn respond(&self, member: &MemberRef, prompt: &str) -> CollaboratorResult<String>;
}
