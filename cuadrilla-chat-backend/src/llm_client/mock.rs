//! Deterministic stand-ins used when `LLM_PROVIDER=mock`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cuadrilla_core::platform::{Assistant, CollaboratorResult, IntroductionJudge, TopicSource};
use cuadrilla_core::tools::{ToolRegistry, LIST_ACTIVE_EVENTS, READ_DOCUMENT};
use cuadrilla_core::MemberRef;

const INTRO_MARKERS: &[&str] = &["my name", "i'm", "i am", "me llamo", "soy "];

const TOPICS: &[&str] = &[
    "Board games night or karaoke night?",
    "What's the best dish anyone in the group cooks?",
    "Sunrise hike or sunset drinks?",
];

#[derive(Debug)]
pub struct MockAssistant {
    tools: Arc<ToolRegistry>,
}

impl MockAssistant {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl Assistant for MockAssistant {
    async fn respond(&self, member: &MemberRef, prompt: &str) -> CollaboratorResult<String> {
        let lower = prompt.to_lowercase();

        if ["plan", "agenda", "event"].iter().any(|k| lower.contains(k)) {
            let listed = self.tools.invoke(LIST_ACTIVE_EVENTS, "{}", member).await;
            let titles: Vec<String> = listed["days"]
                .as_array()
                .into_iter()
                .flatten()
                .flat_map(|day| {
                    let date = day["date"].as_str().unwrap_or_default().to_string();
                    day["events"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .map(move |e| format!("{date} {} {}", e["time"].as_str().unwrap_or_default(), e["title"].as_str().unwrap_or_default()))
                })
                .collect();
            return Ok(if titles.is_empty() {
                "[mock] There are no plans in the next two weeks.".to_string()
            } else {
                format!("[mock] Upcoming plans:\n{}", titles.join("\n"))
            });
        }

        if ["rule", "info", "how"].iter().any(|k| lower.contains(k)) {
            let doc = self.tools.invoke(READ_DOCUMENT, "{}", member).await;
            if let Some(content) = doc["content"].as_str() {
                return Ok(format!("[mock] From the group notes:\n{content}"));
            }
        }

        Ok(format!("[mock] {}, you asked: {}", member.display_name, prompt.trim()))
    }
}

#[derive(Debug, Default)]
pub struct MockJudge;

#[async_trait]
impl IntroductionJudge for MockJudge {
    async fn is_acceptable_introduction(&self, _member: &MemberRef, text: &str) -> CollaboratorResult<bool> {
        let lower = text.to_lowercase();
        Ok(INTRO_MARKERS.iter().any(|m| lower.contains(m)) || lower.split_whitespace().count() >= 8)
    }
}

#[derive(Debug, Default)]
pub struct MockTopics {
    next: AtomicUsize,
}

#[async_trait]
impl TopicSource for MockTopics {
    async fn generate_topic(&self) -> CollaboratorResult<String> {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(TOPICS[i % TOPICS.len()].to_string())
    }
}
