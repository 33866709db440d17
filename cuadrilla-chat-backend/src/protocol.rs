use cuadrilla_core::pipeline::{ChatContext, ChatKind, Intent};
use cuadrilla_core::{ChatId, MemberId, MemberRef, MessageId};
use serde::{Deserialize, Serialize};

// --- 1. Bot API envelope ---
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
}

// --- 2. Inbound updates ---
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub new_chat_members: Vec<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: MemberId,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMember {
    pub status: String,
}

// --- 3. Outbound payloads ---
#[derive(Debug, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

impl From<&cuadrilla_core::platform::Keyboard> for InlineKeyboardMarkup {
    fn from(keyboard: &cuadrilla_core::platform::Keyboard) -> Self {
        Self {
            inline_keyboard: keyboard
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| InlineKeyboardButton {
                            text: b.label.clone(),
                            callback_data: b.payload.clone(),
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

// --- 4. Conversion into intents ---

impl User {
    pub fn member_ref(&self) -> MemberRef {
        let name = match &self.last_name {
            Some(last) if !last.trim().is_empty() => format!("{} {}", self.first_name, last.trim()),
            _ => self.first_name.clone(),
        };
        let member = MemberRef::new(self.id, name);
        match &self.username {
            Some(handle) => member.with_handle(handle.as_str()),
            None => member,
        }
    }
}

impl Chat {
    pub fn context(&self) -> ChatContext {
        match self.kind.as_str() {
            "private" => ChatContext::private(self.id),
            _ => ChatContext {
                chat_id: self.id,
                kind: ChatKind::Group,
            },
        }
    }
}

/// Splits `/name@bot args` into `("name", "args")`. `None` for plain text.
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_lowercase();
    if name.is_empty() {
        return None;
    }
    Some((name, args.to_string()))
}

impl Update {
    /// Intents carried by this update. Messages from bots yield nothing.
    pub fn intents(&self) -> Vec<Intent> {
        if let Some(query) = &self.callback_query {
            let (Some(message), Some(data)) = (&query.message, &query.data) else {
                return Vec::new();
            };
            if query.from.is_bot {
                return Vec::new();
            }
            return vec![Intent::Button {
                chat: message.chat.context(),
                member: query.from.member_ref(),
                payload: data.clone(),
            }];
        }

        let Some(message) = &self.message else {
            return Vec::new();
        };
        let chat = message.chat.context();

        if !message.new_chat_members.is_empty() {
            return message
                .new_chat_members
                .iter()
                .filter(|u| !u.is_bot)
                .map(|u| Intent::MemberJoined {
                    chat,
                    member: u.member_ref(),
                })
                .collect();
        }

        let (Some(from), Some(text)) = (&message.from, &message.text) else {
            return Vec::new();
        };
        if from.is_bot {
            return Vec::new();
        }
        let member = from.member_ref();

        match parse_command(text) {
            Some((name, args)) => vec![Intent::Command {
                chat,
                member,
                name,
                args,
            }],
            None => vec![Intent::Text {
                chat,
                member,
                text: text.clone(),
            }],
        }
    }

    pub fn callback_id(&self) -> Option<&str> {
        self.callback_query.as_ref().map(|q| q.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuadrilla_core::platform::Button;

    fn update(raw: &str) -> Update {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn group_text_becomes_text_intent() {
        let u = update(
            r#"{"update_id":1,"message":{"message_id":10,"from":{"id":7,"is_bot":false,"first_name":"Ana","username":"ana_g"},
                "chat":{"id":-100,"type":"supergroup"},"text":"hola a todos"}}"#,
        );
        let intents = u.intents();
        assert_eq!(
            intents,
            vec![Intent::Text {
                chat: ChatContext::group(-100),
                member: MemberRef::new(7, "Ana").with_handle("ana_g"),
                text: "hola a todos".to_string(),
            }]
        );
    }

    #[test]
    fn commands_drop_bot_suffix() {
        assert_eq!(parse_command("/ia@CuadrillaBot  when is dinner?"), Some(("ia".to_string(), "when is dinner?".to_string())));
        assert_eq!(parse_command("/Agenda"), Some(("agenda".to_string(), String::new())));
        assert_eq!(parse_command("just text"), None);
        assert_eq!(parse_command("/"), None);
    }

    #[test]
    fn joins_skip_bots() {
        let u = update(
            r#"{"update_id":2,"message":{"message_id":11,"from":{"id":7,"first_name":"Ana"},
                "chat":{"id":-100,"type":"group"},
                "new_chat_members":[{"id":8,"first_name":"Luis","last_name":"Gil"},{"id":9,"is_bot":true,"first_name":"spam"}]}}"#,
        );
        assert_eq!(
            u.intents(),
            vec![Intent::MemberJoined {
                chat: ChatContext::group(-100),
                member: MemberRef::new(8, "Luis Gil"),
            }]
        );
    }

    #[test]
    fn callback_becomes_button_intent() {
        let u = update(
            r#"{"update_id":3,"callback_query":{"id":"cb-1","from":{"id":7,"first_name":"Ana"},"data":"join|2025-12-24|0",
                "message":{"message_id":12,"chat":{"id":7,"type":"private"}}}}"#,
        );
        assert_eq!(u.callback_id(), Some("cb-1"));
        assert_eq!(
            u.intents(),
            vec![Intent::Button {
                chat: ChatContext::private(7),
                member: MemberRef::new(7, "Ana"),
                payload: "join|2025-12-24|0".to_string(),
            }]
        );
    }

    #[test]
    fn bot_messages_are_ignored() {
        let u = update(
            r#"{"update_id":4,"message":{"message_id":13,"from":{"id":99,"is_bot":true,"first_name":"other"},
                "chat":{"id":-100,"type":"group"},"text":"/debate"}}"#,
        );
        assert!(u.intents().is_empty());
    }

    #[test]
    fn keyboard_maps_to_inline_markup() {
        let keyboard = vec![vec![Button::new("See plans", "view")]];
        let markup = InlineKeyboardMarkup::from(&keyboard);
        let json = serde_json::to_value(&markup).unwrap();
        assert_eq!(json["inline_keyboard"][0][0]["callback_data"], "view");
        assert_eq!(json["inline_keyboard"][0][0]["text"], "See plans");
    }

    #[test]
    fn error_envelopes_need_no_result() {
        let body: ApiResponse<Message> =
            serde_json::from_str(r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was kicked"}"#).unwrap();
        assert!(!body.ok);
        assert!(body.result.is_none());
        assert_eq!(body.description.as_deref(), Some("Forbidden: bot was kicked"));
    }
}
