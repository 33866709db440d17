use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform user id. Also the chat id of the member's private chat.
pub type MemberId = i64;

/// Platform chat id (group or private chat).
pub type ChatId = i64;

/// Platform message id, scoped to a chat.
pub type MessageId = i64;

/// The one value type used internally to talk about a person. Built once at
/// the platform boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: MemberId,
    #[serde(alias = "nombre")]
    pub display_name: String,
    #[serde(default, alias = "username", skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl MemberRef {
    pub fn new(id: MemberId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        let handle = handle.into();
        self.handle = if handle.trim().is_empty() {
            None
        } else {
            Some(handle.trim_start_matches('@').to_string())
        };
        self
    }

    /// `@handle` when known, otherwise the display name.
    pub fn mention(&self) -> String {
        match &self.handle {
            Some(h) => format!("@{h}"),
            None => self.display_name.clone(),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_prefers_handle() {
        let plain = MemberRef::new(7, "Ana");
        assert_eq!(plain.mention(), "Ana");
        let handled = MemberRef::new(7, "Ana").with_handle("@ana_g");
        assert_eq!(handled.mention(), "@ana_g");
        assert_eq!(MemberRef::new(7, "Ana").with_handle("  ").handle, None);
    }
}
