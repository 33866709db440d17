use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Json, routing::get, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use cuadrilla_core::agenda::{AgendaEngine, DayAgenda, DATE_FORMAT};
use cuadrilla_core::app::{Collaborators, Services, Stores};
use cuadrilla_core::clock::SystemClock;
use cuadrilla_core::config::Settings;
use cuadrilla_core::pipeline::Dispatcher;
use cuadrilla_core::platform::{Assistant, IntroductionJudge, NotificationChannel, TopicSource};
use cuadrilla_core::scheduler::Scheduler;

mod llm_client;
mod protocol;
mod telegram;

use llm_client::mock::{MockAssistant, MockJudge, MockTopics};
use llm_client::{OpenRouterClient, OpenRouterConfig, ToolAssistant};
use protocol::Update;
use telegram::TelegramClient;

/// Pause after a failed `getUpdates` before polling again.
const POLL_BACKOFF: Duration = Duration::from_secs(5);

/// Places a `.env` may live, most specific first: an explicit
/// `DOTENV_PATH`, the working directory, then the workspace root.
fn dotenv_candidates(explicit: Option<PathBuf>, cwd: Option<PathBuf>) -> Vec<PathBuf> {
    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).parent().map(|root| root.join(".env"));
    let mut candidates: Vec<PathBuf> = Vec::new();
    for path in [explicit, cwd.map(|dir| dir.join(".env")), workspace].into_iter().flatten() {
        if !candidates.contains(&path) {
            candidates.push(path);
        }
    }
    candidates
}

/// Loads the first readable `.env`. Variables already set in the process win.
fn load_dotenv() -> Option<PathBuf> {
    let explicit = env::var_os("DOTENV_PATH").map(PathBuf::from);
    let candidates = dotenv_candidates(explicit, env::current_dir().ok());
    candidates.into_iter().filter(|path| path.is_file()).find(|path| match dotenvy::from_path(path) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable .env");
            false
        }
    })
}

/// Language model collaborators, chosen by `LLM_PROVIDER`.
struct LanguageModel {
    provider: String,
    judge: Arc<dyn IntroductionJudge>,
    topics: Arc<dyn TopicSource>,
    openrouter: Option<Arc<OpenRouterClient>>,
}

fn language_model() -> Result<LanguageModel> {
    let mut llm_provider = env::var("LLM_PROVIDER")
        .unwrap_or_else(|_| "mock".to_string())
        .to_lowercase();

    // If openrouter is requested but the key is missing, fall back to mock.
    let openrouter_api_key = if llm_provider == "openrouter" {
        match env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => {
                warn!(
                    "LLM_PROVIDER is set to 'openrouter' but OPENROUTER_API_KEY is not set or is empty. \
                     Falling back to 'mock' provider."
                );
                llm_provider = "mock".to_string();
                String::new()
            }
        }
    } else {
        String::new()
    };

    if llm_provider != "openrouter" {
        info!("LLM provider set to mock; OpenRouter client not required");
        return Ok(LanguageModel {
            provider: llm_provider,
            judge: Arc::new(MockJudge),
            topics: Arc::new(MockTopics::default()),
            openrouter: None,
        });
    }

    let config = OpenRouterConfig {
        api_key: openrouter_api_key,
        model: env::var("OPENROUTER_MODEL").unwrap_or_else(|_| "google/gemini-2.0-flash-exp".to_string()),
        url: env::var("OPENROUTER_URL")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".to_string()),
    };
    info!(openrouter_url = %config.url, openrouter_model = %config.model, "OpenRouter LLM client configured");

    let client = Arc::new(OpenRouterClient::new(config).context("failed to build OpenRouter HTTP client")?);
    Ok(LanguageModel {
        provider: llm_provider,
        judge: client.clone(),
        topics: client.clone(),
        openrouter: Some(client),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cuadrilla_chat_backend=info,cuadrilla_core=info,axum=info".into()),
        )
        .init();

    match load_dotenv() {
        Some(path) => info!(path = %path.display(), "Loaded .env"),
        None => info!("No .env loaded; using the process environment"),
    }

    let settings = Settings::from_env();
    let token = env::var("TELEGRAM_TOKEN").context("TELEGRAM_TOKEN must be set")?;
    let api_url = env::var("TELEGRAM_API_URL").unwrap_or_else(|_| "https://api.telegram.org".to_string());
    let bind_addr = env::var("CUADRILLA_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let telegram = Arc::new(TelegramClient::new(&api_url, &token).context("failed to build Telegram HTTP client")?);
    let model = language_model()?;

    info!(
        data_dir = %settings.data_dir.display(),
        group_chat_id = settings.group_chat_id,
        llm_provider = %model.provider,
        http_bind = %bind_addr,
        "Initializing Cuadrilla backend"
    );

    let collaborators = Collaborators {
        notifier: telegram.clone(),
        membership: telegram.clone(),
        judge: model.judge.clone(),
        topics: model.topics.clone(),
    };
    let stores = Stores::json(&settings);
    let services = Services::open(settings, Arc::new(SystemClock), collaborators, stores).await;

    let assistant: Arc<dyn Assistant> = match &model.openrouter {
        Some(client) => Arc::new(ToolAssistant::new(client.clone(), services.tools.clone())),
        None => Arc::new(MockAssistant::new(services.tools.clone())),
    };
    let dispatcher = Arc::new(services.dispatcher(assistant));

    let scheduler = Scheduler::new();
    services
        .start_background_jobs(&scheduler)
        .await
        .context("failed to register daily jobs")?;

    let poller = tokio::spawn(poll_updates(telegram.clone(), dispatcher));

    let app = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/agenda", get(agenda_window))
        .with_state(services.agenda.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "Cuadrilla HTTP surface listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    poller.abort();
    services.shutdown(&scheduler);
    info!("Cuadrilla backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// --- Telegram long polling ---

async fn poll_updates(telegram: Arc<TelegramClient>, dispatcher: Arc<Dispatcher>) {
    let mut offset = 0i64;
    loop {
        let updates = match telegram.get_updates(offset).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed; retrying");
                tokio::time::sleep(POLL_BACKOFF).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            // Assistant answers can take a while; one slow update must not
            // hold up the rest.
            tokio::spawn(handle_update(telegram.clone(), dispatcher.clone(), update));
        }
    }
}

async fn handle_update(telegram: Arc<TelegramClient>, dispatcher: Arc<Dispatcher>, update: Update) {
    if let Some(callback_id) = update.callback_id() {
        if let Err(e) = telegram.answer_callback_query(callback_id).await {
            warn!(update_id = update.update_id, error = %e, "answerCallbackQuery failed");
        }
    }

    for intent in update.intents() {
        for reply in dispatcher.dispatch(intent).await {
            if let Err(e) = telegram
                .send_message(reply.chat_id, &reply.text, reply.keyboard.as_ref())
                .await
            {
                error!(chat_id = reply.chat_id, error = %e, "Failed to deliver reply");
            }
        }
    }
}

// --- HTTP surface ---

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "cuadrilla-chat-backend",
            "time": Utc::now().to_rfc3339(),
        })),
    )
}

async fn agenda_window(State(agenda): State<Arc<AgendaEngine>>) -> Json<Value> {
    let days = agenda.list_active_events(None, None).await;
    Json(agenda_json(&days))
}

fn agenda_json(days: &[DayAgenda]) -> Value {
    let days: Vec<Value> = days
        .iter()
        .map(|day| {
            let events: Vec<Value> = day
                .events
                .iter()
                .map(|(index, e)| {
                    json!({
                        "index": index,
                        "time": e.time,
                        "title": e.title,
                        "creator_id": e.creator_id,
                        "attendees": e.attendees,
                    })
                })
                .collect();
            json!({ "date": day.date.format(DATE_FORMAT).to_string(), "events": events })
        })
        .collect();
    json!({ "days": days })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use cuadrilla_core::agenda::Event;
    use cuadrilla_core::MemberRef;

    #[test]
    fn agenda_json_keeps_stable_indices() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 24).unwrap();
        let event = Event {
            time: "20:00".to_string(),
            title: "Cena".to_string(),
            attendees: vec![MemberRef::new(2, "Luis")],
            creator_id: 1,
            active: true,
        };
        let json = agenda_json(&[DayAgenda {
            date,
            events: vec![(1, event)],
        }]);
        assert_eq!(json["days"][0]["date"], "2025-12-24");
        assert_eq!(json["days"][0]["events"][0]["index"], 1);
        assert_eq!(json["days"][0]["events"][0]["attendees"][0]["display_name"], "Luis");
    }

    #[test]
    fn dotenv_candidates_prefer_explicit_path_and_skip_duplicates() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).parent().unwrap().to_path_buf();
        let candidates = dotenv_candidates(Some(PathBuf::from("/etc/cuadrilla.env")), Some(root.clone()));
        assert_eq!(candidates, vec![PathBuf::from("/etc/cuadrilla.env"), root.join(".env")]);

        let fallback = dotenv_candidates(None, None);
        assert_eq!(fallback, vec![root.join(".env")]);
    }
}
