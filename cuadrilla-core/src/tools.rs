//! Capabilities the language model may call. Results are always JSON the
//! model can read, including failures.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agenda::{parse_date, AgendaEngine, DATE_FORMAT};
use crate::error::CoreError;
use crate::member::MemberRef;

pub const CREATE_EVENT: &str = "create_event";
pub const LIST_ACTIVE_EVENTS: &str = "list_active_events";
pub const READ_DOCUMENT: &str = "read_document";

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
struct CreateEventArgs {
    date: String,
    time: String,
    title: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListEventsArgs {
    #[serde(default)]
    from_date: Option<String>,
    #[serde(default)]
    to_date: Option<String>,
}

pub struct ToolRegistry {
    agenda: Arc<AgendaEngine>,
    document_path: PathBuf,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("document_path", &self.document_path)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(agenda: Arc<AgendaEngine>, document_path: impl Into<PathBuf>) -> Self {
        Self {
            agenda,
            document_path: document_path.into(),
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: CREATE_EVENT,
                description: "Create a new plan on the group agenda. The caller becomes its creator.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "date": { "type": "string", "description": "Day of the plan, YYYY-MM-DD" },
                        "time": { "type": "string", "description": "Start time, HH:MM (24h)" },
                        "title": { "type": "string", "description": "Short description of the plan" }
                    },
                    "required": ["date", "time", "title"]
                }),
            },
            ToolDefinition {
                name: LIST_ACTIVE_EVENTS,
                description: "List active plans between two dates (inclusive). Without dates, the next two weeks.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "from_date": { "type": "string", "description": "First day, YYYY-MM-DD" },
                        "to_date": { "type": "string", "description": "Last day, YYYY-MM-DD" }
                    }
                }),
            },
            ToolDefinition {
                name: READ_DOCUMENT,
                description: "Read the group's reference document (rules, FAQ, how the bot works).",
                parameters: json!({ "type": "object", "properties": {} }),
            },
        ]
    }

    /// Runs a tool call. `arguments` is the raw JSON string from the model.
    pub async fn invoke(&self, name: &str, arguments: &str, caller: &MemberRef) -> Value {
        let raw = if arguments.trim().is_empty() { "{}" } else { arguments };
        info!(tool = name, member_id = caller.id, "Tool call");

        let result = match name {
            CREATE_EVENT => match serde_json::from_str::<CreateEventArgs>(raw) {
                Ok(args) => self.create_event(args, caller).await,
                Err(e) => Err(CoreError::invalid(format!("bad arguments: {e}"))),
            },
            LIST_ACTIVE_EVENTS => match serde_json::from_str::<ListEventsArgs>(raw) {
                Ok(args) => self.list_active_events(args).await,
                Err(e) => Err(CoreError::invalid(format!("bad arguments: {e}"))),
            },
            READ_DOCUMENT => self.read_document().await,
            other => Err(CoreError::not_found(format!("tool '{other}'"))),
        };

        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool call failed");
                json!({ "ok": false, "error": e.to_string() })
            }
        }
    }

    async fn create_event(&self, args: CreateEventArgs, caller: &MemberRef) -> Result<Value, CoreError> {
        let created = self
            .agenda
            .create_event(&args.date, &args.time, &args.title, caller.id)
            .await?;
        let event = self.agenda.get_event(created.date, created.index).await?;
        Ok(json!({
            "ok": true,
            "event": {
                "date": created.date.format(DATE_FORMAT).to_string(),
                "index": created.index,
                "time": event.time,
                "title": event.title,
            }
        }))
    }

    async fn list_active_events(&self, args: ListEventsArgs) -> Result<Value, CoreError> {
        let from = args.from_date.as_deref().map(parse_date).transpose()?;
        let to = args.to_date.as_deref().map(parse_date).transpose()?;
        let days = self.agenda.list_active_events(from, to).await;

        let days: Vec<Value> = days
            .into_iter()
            .map(|day| {
                let events: Vec<Value> = day
                    .events
                    .into_iter()
                    .map(|(index, e)| {
                        json!({
                            "index": index,
                            "time": e.time,
                            "title": e.title,
                            "attendees": e.attendees.iter().map(|a| a.display_name.clone()).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                json!({ "date": day.date.format(DATE_FORMAT).to_string(), "events": events })
            })
            .collect();

        Ok(json!({ "ok": true, "days": days }))
    }

    async fn read_document(&self) -> Result<Value, CoreError> {
        match tokio::fs::read_to_string(&self.document_path).await {
            Ok(content) => Ok(json!({ "ok": true, "content": content })),
            Err(e) => {
                warn!(path = %self.document_path.display(), error = %e, "Reference document unreadable");
                Err(CoreError::not_found("reference document"))
            }
        }
    }
}
