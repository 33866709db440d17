use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use cuadrilla_core::platform::{
    CollaboratorResult, Keyboard, MemberRole, MembershipControl, NotificationChannel,
};
use cuadrilla_core::{ChatId, CollaboratorError, MemberId, MessageId};

use crate::protocol::{ApiResponse, ChatMember, InlineKeyboardMarkup, Message, Update};

/// Seconds the server holds a `getUpdates` call open.
const LONG_POLL_SECS: u64 = 30;

// --- Telegram Bot API client ---
pub struct TelegramClient {
    http_client: Client,
    base_url: String,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The token is part of the base URL.
        f.debug_struct("TelegramClient").finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(api_url: &str, token: &str) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 15))
            .build()?;
        Ok(Self {
            http_client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, payload: Value) -> CollaboratorResult<T> {
        debug!(method = method, "Bot API call");
        let response = self
            .http_client
            .post(format!("{}/{}", self.base_url, method))
            .json(&payload)
            .send()
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("{method}: {}", e.without_url())))?;

        let status = response.status();
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("{method}: HTTP {status}: {}", e.without_url())))?;

        if !body.ok {
            let reason = body.description.unwrap_or_else(|| format!("HTTP {status}"));
            return Err(CollaboratorError::Rejected(format!("{method}: {reason}")));
        }
        body.result
            .ok_or_else(|| CollaboratorError::Rejected(format!("{method}: empty result")))
    }

    pub async fn get_updates(&self, offset: i64) -> CollaboratorResult<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": LONG_POLL_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    pub async fn answer_callback_query(&self, callback_id: &str) -> CollaboratorResult<()> {
        self.call::<bool>("answerCallbackQuery", json!({ "callback_query_id": callback_id }))
            .await
            .map(|_| ())
    }
}

fn role_from_status(status: &str) -> MemberRole {
    match status {
        "creator" => MemberRole::Owner,
        "administrator" => MemberRole::Administrator,
        "restricted" => MemberRole::Restricted,
        "left" => MemberRole::Left,
        "kicked" => MemberRole::Banned,
        "member" => MemberRole::Member,
        other => {
            warn!(status = other, "Unknown chat member status; treating as member");
            MemberRole::Member
        }
    }
}

#[async_trait]
impl NotificationChannel for TelegramClient {
    async fn send_direct_message(&self, member_id: MemberId, text: &str) -> CollaboratorResult<()> {
        // A member's private chat shares their user id.
        self.send_message(member_id, text, None).await.map(|_| ())
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> CollaboratorResult<MessageId> {
        let mut payload = json!({ "chat_id": chat_id, "text": text });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = serde_json::to_value(InlineKeyboardMarkup::from(keyboard))
                .map_err(|e| CollaboratorError::Rejected(e.to_string()))?;
        }
        let sent: Message = self.call("sendMessage", payload).await?;
        Ok(sent.message_id)
    }

    async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> CollaboratorResult<()> {
        self.call::<bool>(
            "pinChatMessage",
            json!({ "chat_id": chat_id, "message_id": message_id, "disable_notification": true }),
        )
        .await
        .map(|_| ())
    }

    async fn unpin_message(&self, chat_id: ChatId, message_id: MessageId) -> CollaboratorResult<()> {
        self.call::<bool>("unpinChatMessage", json!({ "chat_id": chat_id, "message_id": message_id }))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl MembershipControl for TelegramClient {
    async fn remove_member(&self, group_id: ChatId, member_id: MemberId) -> CollaboratorResult<()> {
        self.call::<bool>("banChatMember", json!({ "chat_id": group_id, "user_id": member_id }))
            .await
            .map(|_| ())
    }

    async fn unban_member(&self, group_id: ChatId, member_id: MemberId) -> CollaboratorResult<()> {
        self.call::<bool>(
            "unbanChatMember",
            json!({ "chat_id": group_id, "user_id": member_id, "only_if_banned": true }),
        )
        .await
        .map(|_| ())
    }

    async fn get_member_role(&self, group_id: ChatId, member_id: MemberId) -> CollaboratorResult<MemberRole> {
        let member: ChatMember = self
            .call("getChatMember", json!({ "chat_id": group_id, "user_id": member_id }))
            .await?;
        Ok(role_from_status(&member.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_member_statuses() {
        assert_eq!(role_from_status("creator"), MemberRole::Owner);
        assert!(role_from_status("administrator").is_admin());
        assert_eq!(role_from_status("kicked"), MemberRole::Banned);
        assert!(!role_from_status("something_new").is_admin());
    }

    #[test]
    fn base_url_embeds_token() {
        let client = TelegramClient::new("https://api.telegram.org/", "123:abc").unwrap();
        assert_eq!(client.base_url, "https://api.telegram.org/bot123:abc");
    }

    #[tokio::test]
    async fn transport_errors_do_not_carry_the_token() {
        let client = TelegramClient::new("http://127.0.0.1:9", "123:secret-token").unwrap();
        let err = client.get_updates(0).await.unwrap_err().to_string();
        assert!(err.contains("getUpdates"), "{err}");
        assert!(!err.contains("secret-token"), "{err}");
    }
}
