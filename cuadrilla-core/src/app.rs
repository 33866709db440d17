//! Wiring: builds every component once, from settings and collaborators.

use rand::Rng;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::agenda::{AgendaEngine, Catalog};
use crate::clock::Clock;
use crate::config::Settings;
use crate::debate::{DebateManager, DebateState};
use crate::error::CoreResult;
use crate::ledger::{EngagementLedger, MemberTable};
use crate::leveling::LevelTable;
use crate::pipeline::Dispatcher;
use crate::platform::{Assistant, IntroductionJudge, MembershipControl, NotificationChannel, TopicSource};
use crate::scheduler::Scheduler;
use crate::store::{JsonFileStore, MemoryStore, RecordStore};
use crate::sweep::InactivitySweep;
use crate::tools::ToolRegistry;
use crate::verification::VerificationMachine;
use crate::word_game::{WordGame, WordGameState};

pub const SWEEP_JOB: &str = "inactivity_sweep";
pub const DEBATE_JOB: &str = "daily_debate";
pub const WORD_GAME_JOB: &str = "word_game";

#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn NotificationChannel>,
    pub membership: Arc<dyn MembershipControl>,
    pub judge: Arc<dyn IntroductionJudge>,
    pub topics: Arc<dyn TopicSource>,
}

#[derive(Clone)]
pub struct Stores {
    pub agenda: Arc<dyn RecordStore<Catalog>>,
    pub members: Arc<dyn RecordStore<MemberTable>>,
    pub debate: Arc<dyn RecordStore<DebateState>>,
    pub word_game: Arc<dyn RecordStore<WordGameState>>,
}

impl Stores {
    pub fn json(settings: &Settings) -> Self {
        Self {
            agenda: Arc::new(JsonFileStore::new(settings.agenda_path())),
            members: Arc::new(JsonFileStore::new(settings.members_path())),
            debate: Arc::new(JsonFileStore::new(settings.debate_path())),
            word_game: Arc::new(JsonFileStore::new(settings.word_game_path())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            agenda: Arc::new(MemoryStore::new(Catalog::new())),
            members: Arc::new(MemoryStore::new(MemberTable::new())),
            debate: Arc::new(MemoryStore::new(DebateState::default())),
            word_game: Arc::new(MemoryStore::new(WordGameState::default())),
        }
    }
}

pub struct Services {
    pub settings: Settings,
    pub agenda: Arc<AgendaEngine>,
    pub ledger: Arc<EngagementLedger>,
    pub verification: Arc<VerificationMachine>,
    pub sweep: Arc<InactivitySweep>,
    pub debate: Arc<DebateManager>,
    pub word_game: Arc<WordGame>,
    pub tools: Arc<ToolRegistry>,
}

impl Services {
    pub async fn open(
        settings: Settings,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        stores: Stores,
    ) -> Self {
        let agenda = Arc::new(
            AgendaEngine::open(stores.agenda, clock.clone())
                .await
                .with_horizons(settings.agenda_horizon_days, settings.lookup_horizon_days),
        );

        let ledger = Arc::new(
            EngagementLedger::open(stores.members, LevelTable::standard(), settings.xp_policy(), clock).await,
        );

        let verification = VerificationMachine::new(
            ledger.clone(),
            collaborators.notifier.clone(),
            collaborators.membership.clone(),
            collaborators.judge.clone(),
            settings.verification(),
        );

        let sweep = Arc::new(
            InactivitySweep::new(
                ledger.clone(),
                collaborators.notifier.clone(),
                collaborators.membership.clone(),
                settings.group_chat_id,
            )
            .with_threshold(settings.inactivity_threshold()),
        );

        let debate = Arc::new(
            DebateManager::open(
                stores.debate,
                collaborators.notifier.clone(),
                collaborators.membership.clone(),
                collaborators.topics.clone(),
                settings.group_chat_id,
            )
            .await,
        );

        let word_game = Arc::new(
            WordGame::open(
                stores.word_game,
                collaborators.notifier.clone(),
                settings.group_chat_id,
                settings.word_game_points,
            )
            .await,
        );

        let tools = Arc::new(ToolRegistry::new(agenda.clone(), settings.document_path.clone()));

        info!(
            data_dir = %settings.data_dir.display(),
            group_chat_id = settings.group_chat_id,
            members = ledger.len().await,
            "Services ready"
        );

        Self {
            settings,
            agenda,
            ledger,
            verification,
            sweep,
            debate,
            word_game,
            tools,
        }
    }

    pub fn dispatcher(&self, assistant: Arc<dyn Assistant>) -> Dispatcher {
        Dispatcher::new(
            self.agenda.clone(),
            self.ledger.clone(),
            self.verification.clone(),
            self.debate.clone(),
            self.word_game.clone(),
            assistant,
            self.settings.group_chat_id,
        )
    }

    /// Registers the daily jobs and the word game, and re-arms verification timers lost to a
    /// restart. Group jobs are skipped when no group is configured.
    pub async fn start_background_jobs(&self, scheduler: &Scheduler) -> CoreResult<()> {
        if !self.settings.has_group() {
            warn!("GROUP_CHAT_ID not set; sweep, debate and verification jobs disabled");
            return Ok(());
        }

        let sweep = self.sweep.clone();
        scheduler.run_daily(SWEEP_JOB, &self.settings.sweep_time, move || {
            let sweep = sweep.clone();
            async move {
                if let Err(e) = sweep.run().await {
                    error!(error = %e, "Inactivity sweep aborted");
                }
            }
        })?;

        let debate = self.debate.clone();
        scheduler.run_daily(DEBATE_JOB, &self.settings.debate_time, move || {
            let debate = debate.clone();
            async move {
                if let Err(e) = debate.post_daily_debate().await {
                    error!(error = %e, "Daily debate failed");
                }
            }
        })?;

        match self.settings.word_game_gaps() {
            Some((min, max)) => {
                let word_game = self.word_game.clone();
                scheduler.run_with_gaps(
                    WORD_GAME_JOB,
                    move || rand::thread_rng().gen_range(min..=max),
                    move || {
                        let word_game = word_game.clone();
                        async move {
                            if let Err(e) = word_game.start_round().await {
                                error!(error = %e, "Word game round failed to start");
                            }
                        }
                    },
                );
            }
            None => info!("Word game disabled"),
        }

        self.verification.resume().await;
        Ok(())
    }

    pub fn shutdown(&self, scheduler: &Scheduler) {
        scheduler.shutdown();
        self.verification.shutdown();
        info!("Background jobs stopped");
    }
}
