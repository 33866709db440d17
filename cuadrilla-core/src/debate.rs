//! Daily discussion prompt: posted to the group and pinned, replacing the
//! previous day's pin.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::member::{ChatId, MemberId, MessageId};
use crate::platform::{MembershipControl, NotificationChannel, TopicSource};
use crate::store::{Change, Collection, RecordStore};

const FALLBACK_TOPICS: &[&str] = &[
    "Beach or mountains for the next group trip?",
    "Is pineapple on pizza a crime or a delicacy?",
    "Early-morning plans or late-night plans: which are better?",
    "Should group dinners always split the bill evenly?",
    "What's the most overrated film everyone loves?",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateState {
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub last_topic: Option<String>,
    #[serde(default)]
    pub last_posted_at: Option<DateTime<Utc>>,
}

pub struct DebateManager {
    state: Collection<DebateState>,
    notifier: Arc<dyn NotificationChannel>,
    membership: Arc<dyn MembershipControl>,
    topics: Arc<dyn TopicSource>,
    group_id: ChatId,
}

impl std::fmt::Debug for DebateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebateManager")
            .field("state", &self.state)
            .field("group_id", &self.group_id)
            .finish()
    }
}

impl DebateManager {
    pub async fn open(
        store: Arc<dyn RecordStore<DebateState>>,
        notifier: Arc<dyn NotificationChannel>,
        membership: Arc<dyn MembershipControl>,
        topics: Arc<dyn TopicSource>,
        group_id: ChatId,
    ) -> Self {
        Self {
            state: Collection::open("debate", store).await,
            notifier,
            membership,
            topics,
            group_id,
        }
    }

    pub async fn current(&self) -> DebateState {
        self.state.snapshot().await
    }

    pub async fn post_daily_debate(&self) -> CoreResult<MessageId> {
        let previous = self.state.read(|s| s.last_message_id).await;
        if let Some(old) = previous {
            if let Err(e) = self.notifier.unpin_message(self.group_id, old).await {
                warn!(message_id = old, error = %e, "Could not unpin previous debate");
            }
        }

        let topic = match self.topics.generate_topic().await {
            Ok(raw) => clean_topic(&raw),
            Err(e) => {
                warn!(error = %e, "Topic source unavailable; using a stock topic");
                None
            }
        }
        .unwrap_or_else(fallback_topic);

        let text = format!("Debate of the day:\n\n{topic}\n\nWhat do you think?");
        let message_id = self
            .notifier
            .send_message(self.group_id, &text, None)
            .await?;

        if let Err(e) = self.notifier.pin_message(self.group_id, message_id).await {
            warn!(message_id = message_id, error = %e, "Could not pin debate");
        }

        let now = Utc::now();
        self.state
            .update(|s| {
                s.last_message_id = Some(message_id);
                s.last_topic = Some(topic.clone());
                s.last_posted_at = Some(now);
                Ok(Change::Commit(()))
            })
            .await?;

        info!(message_id = message_id, topic = %topic, "Debate posted");
        Ok(message_id)
    }

    /// Posts a debate now. Only group admins may do this, and only in the
    /// group itself.
    pub async fn force_debate(&self, chat_id: ChatId, member_id: MemberId) -> CoreResult<MessageId> {
        if chat_id != self.group_id {
            return Err(CoreError::Forbidden("debates can only be started in the group".to_string()));
        }
        let role = self.membership.get_member_role(self.group_id, member_id).await?;
        if !role.is_admin() {
            return Err(CoreError::Forbidden("only group admins can start a debate".to_string()));
        }
        info!(member_id = member_id, "Debate forced by admin");
        self.post_daily_debate().await
    }
}

fn clean_topic(raw: &str) -> Option<String> {
    let cleaned = raw.replace('*', "");
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

fn fallback_topic() -> String {
    FALLBACK_TOPICS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("What's the best plan for this weekend?")
        .to_string()
}
