//! Newcomer introduction flow.
//!
//! ```text
//! join ──► pending ──(T1)──► warned ──(T2)──► evicted
//!             │                 │
//!             └──── introduction ┴──► verified
//! ```
//!
//! Timers are cancelled on verification, and each timer step is a
//! compare-and-set on the ledger, so a timer that loses the race to a
//! verification does nothing. Eviction moves the record to `removing`
//! first and deletes it only once the platform removal succeeded.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::CoreResult;
use crate::ledger::{EngagementLedger, VerificationStatus};
use crate::member::{ChatId, MemberId, MemberRef};
use crate::platform::{IntroductionJudge, MembershipControl, NotificationChannel};
use crate::scheduler::TimerRegistry;

pub const DEFAULT_WARN_AFTER: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_EVICT_AFTER_WARNING: Duration = Duration::from_secs(5 * 60);

/// Introductions shorter than this are rejected when the judge is down.
const FALLBACK_MIN_WORDS: usize = 3;

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub group_id: ChatId,
    pub warn_after: Duration,
    pub evict_after_warning: Duration,
}

impl VerificationConfig {
    pub fn new(group_id: ChatId) -> Self {
        Self {
            group_id,
            warn_after: DEFAULT_WARN_AFTER,
            evict_after_warning: DEFAULT_EVICT_AFTER_WARNING,
        }
    }
}

/// What the gate decided about one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Sender is not in the introduction flow.
    Open,
    /// This message completed the introduction.
    JustVerified,
    /// Sender still owes an introduction; the message goes no further.
    AwaitingIntroduction,
}

pub struct VerificationMachine {
    ledger: Arc<EngagementLedger>,
    notifier: Arc<dyn NotificationChannel>,
    membership: Arc<dyn MembershipControl>,
    judge: Arc<dyn IntroductionJudge>,
    timers: TimerRegistry<MemberId>,
    config: VerificationConfig,
}

impl std::fmt::Debug for VerificationMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationMachine")
            .field("timers", &self.timers)
            .field("config", &self.config)
            .finish()
    }
}

impl VerificationMachine {
    pub fn new(
        ledger: Arc<EngagementLedger>,
        notifier: Arc<dyn NotificationChannel>,
        membership: Arc<dyn MembershipControl>,
        judge: Arc<dyn IntroductionJudge>,
        config: VerificationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            notifier,
            membership,
            judge,
            timers: TimerRegistry::new(),
            config,
        })
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub fn has_pending_timer(&self, member_id: MemberId) -> bool {
        self.timers.is_pending(&member_id)
    }

    pub async fn on_member_joined(self: &Arc<Self>, member: &MemberRef) -> CoreResult<()> {
        self.ledger.enroll_pending(member).await?;
        self.arm_warning(member.clone(), self.config.warn_after);
        info!(member_id = member.id, warn_after_secs = self.config.warn_after.as_secs(), "Verification started");
        Ok(())
    }

    /// Re-arms timers for members caught mid-flow by a restart. Each gets a
    /// full window again.
    pub async fn resume(self: &Arc<Self>) -> usize {
        let pending = self.ledger.members_with_status(VerificationStatus::Pending).await;
        let mut warned = self.ledger.members_with_status(VerificationStatus::Warned).await;
        warned.extend(self.ledger.members_with_status(VerificationStatus::Removing).await);
        let resumed = pending.len() + warned.len();
        for member in pending {
            self.arm_warning(member, self.config.warn_after);
        }
        for member in warned {
            self.arm_eviction(member, self.config.evict_after_warning);
        }
        if resumed > 0 {
            info!(count = resumed, "Verification timers resumed");
        }
        resumed
    }

    /// Runs the gate for a message from `member`.
    pub async fn screen_message(&self, member: &MemberRef, text: &str) -> CoreResult<Gate> {
        let status = self.ledger.get_status(member.id).await;
        if !status.needs_introduction() {
            return Ok(Gate::Open);
        }
        if status == VerificationStatus::Removing {
            debug!(member_id = member.id, "Message arrived after eviction started");
            return Ok(Gate::AwaitingIntroduction);
        }

        let acceptable = match self.judge.is_acceptable_introduction(member, text).await {
            Ok(verdict) => verdict,
            Err(e) => {
                let fallback = text.split_whitespace().count() >= FALLBACK_MIN_WORDS;
                warn!(member_id = member.id, error = %e, accepted = fallback, "Introduction judge unavailable; using word count");
                fallback
            }
        };

        if !acceptable {
            debug!(member_id = member.id, "Message did not qualify as introduction");
            return Ok(Gate::AwaitingIntroduction);
        }

        if self.confirm(member.id).await? {
            Ok(Gate::JustVerified)
        } else {
            Ok(Gate::AwaitingIntroduction)
        }
    }

    /// Marks the member verified, then drops any outstanding timer. Timers
    /// stay armed if the status cannot be written. Returns false when the
    /// member was no longer awaiting an introduction.
    pub async fn confirm(&self, member_id: MemberId) -> CoreResult<bool> {
        if !self.ledger.complete_introduction(member_id).await? {
            debug!(member_id = member_id, "Nothing to confirm");
            return Ok(false);
        }
        let cancelled = self.timers.cancel(&member_id);
        info!(member_id = member_id, timer_cancelled = cancelled, "Member verified");
        Ok(true)
    }

    fn arm_warning(self: &Arc<Self>, member: MemberRef, delay: Duration) -> u64 {
        let machine = Arc::clone(self);
        self.timers.schedule(member.id, delay, move || async move {
            machine.warning_due(member).await;
        })
    }

    fn arm_eviction(self: &Arc<Self>, member: MemberRef, delay: Duration) -> u64 {
        let machine = Arc::clone(self);
        self.timers.schedule(member.id, delay, move || async move {
            machine.eviction_due(member).await;
        })
    }

    async fn warning_due(self: Arc<Self>, member: MemberRef) {
        match self
            .ledger
            .transition_status(member.id, VerificationStatus::Pending, VerificationStatus::Warned)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(member_id = member.id, "Warning timer found member no longer pending");
                return;
            }
            Err(e) => {
                error!(member_id = member.id, error = %e, "Could not record warning; retrying later");
                self.arm_warning(member, self.config.evict_after_warning);
                return;
            }
        }

        let minutes = self.config.evict_after_warning.as_secs().div_ceil(60);
        let text = format!(
            "{}, we haven't heard from you yet! Please introduce yourself in the next {minutes} minutes or you'll be removed from the group.",
            member.mention()
        );
        if let Err(e) = self.notifier.send_message(self.config.group_id, &text, None).await {
            warn!(member_id = member.id, error = %e, "Failed to deliver introduction warning");
        }
        info!(member_id = member.id, "Member warned");

        // A confirm that persisted before this check either cancelled the
        // new timer already or is seen here.
        let member_id = member.id;
        let generation = self.arm_eviction(member, self.config.evict_after_warning);
        if self.ledger.get_status(member_id).await != VerificationStatus::Warned
            && self.timers.cancel_generation(&member_id, generation)
        {
            debug!(member_id = member_id, "Member verified while being warned; eviction not armed");
        }
    }

    async fn eviction_due(self: Arc<Self>, member: MemberRef) {
        // A Removing status means an earlier attempt got partway.
        let claimed = match self.ledger.get_status(member.id).await {
            VerificationStatus::Removing => Ok(true),
            _ => {
                self.ledger
                    .transition_status(member.id, VerificationStatus::Warned, VerificationStatus::Removing)
                    .await
            }
        };
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                debug!(member_id = member.id, "Eviction timer found member no longer warned");
                return;
            }
            Err(e) => {
                error!(member_id = member.id, error = %e, "Could not start eviction; retrying later");
                self.arm_eviction(member, self.config.evict_after_warning);
                return;
            }
        }

        let group = self.config.group_id;
        if let Err(e) = self.membership.remove_member(group, member.id).await {
            error!(member_id = member.id, error = %e, "Failed to remove unverified member; retrying later");
            // Back to warned so an introduction in the meantime still counts.
            if let Err(e) = self
                .ledger
                .transition_status(member.id, VerificationStatus::Removing, VerificationStatus::Warned)
                .await
            {
                error!(member_id = member.id, error = %e, "Could not reopen introduction window");
            }
            self.arm_eviction(member, self.config.evict_after_warning);
            return;
        }
        if let Err(e) = self.membership.unban_member(group, member.id).await {
            warn!(member_id = member.id, error = %e, "Failed to lift ban after removal");
        }
        if let Err(e) = self
            .ledger
            .evict_if_status(member.id, VerificationStatus::Removing)
            .await
        {
            error!(member_id = member.id, error = %e, "Member removed but record not deleted");
        }

        let text = format!(
            "{} was removed for not introducing themselves. They can rejoin any time.",
            member.display_name
        );
        if let Err(e) = self.notifier.send_message(group, &text, None).await {
            warn!(member_id = member.id, error = %e, "Failed to announce eviction");
        }
        info!(member_id = member.id, "Unverified member evicted");
    }

    pub fn shutdown(&self) {
        self.timers.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::CoreError;
    use crate::leveling::LevelTable;
    use crate::ledger::{MemberTable, XpPolicy};
    use crate::store::MemoryStore;
    use crate::member::MessageId;
    use crate::platform::{CollaboratorResult, Keyboard};
    use crate::testing::{KeywordJudge, RecordingChannel, RecordingMembership};

    const GROUP: ChatId = -100;

    struct Fixture {
        machine: Arc<VerificationMachine>,
        ledger: Arc<EngagementLedger>,
        store: Arc<MemoryStore<MemberTable>>,
        channel: Arc<RecordingChannel>,
        membership: Arc<RecordingMembership>,
    }

    async fn fixture(judge: KeywordJudge) -> Fixture {
        let store = Arc::new(MemoryStore::new(MemberTable::new()));
        let ledger = Arc::new(
            EngagementLedger::open(
                store.clone(),
                LevelTable::standard(),
                XpPolicy::default(),
                Arc::new(SystemClock),
            )
            .await,
        );
        let channel = Arc::new(RecordingChannel::new());
        let membership = Arc::new(RecordingMembership::new());
        let machine = VerificationMachine::new(
            ledger.clone(),
            channel.clone(),
            membership.clone(),
            Arc::new(judge),
            VerificationConfig::new(GROUP),
        );
        Fixture {
            machine,
            ledger,
            store,
            channel,
            membership,
        }
    }

    fn newcomer() -> MemberRef {
        MemberRef::new(42, "Nico")
    }

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_newcomer_is_warned_then_evicted() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.machine.on_member_joined(&newcomer()).await.unwrap();
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Pending);

        sleep_secs(601).await;
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Warned);
        assert_eq!(f.channel.sent_to(GROUP).len(), 1);

        sleep_secs(300).await;
        assert!(f.ledger.get(42).await.is_none());
        assert_eq!(f.membership.removed(), vec![42]);
        assert_eq!(f.membership.unbanned(), vec![42]);
        assert!(!f.machine.has_pending_timer(42));
    }

    #[tokio::test(start_paused = true)]
    async fn verification_one_second_before_eviction_wins() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.machine.on_member_joined(&newcomer()).await.unwrap();

        // T1 + 4min59s
        sleep_secs(600 + 299).await;
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Warned);
        let gate = f.machine.screen_message(&newcomer(), "hola a todos, soy Nico").await.unwrap();
        assert_eq!(gate, Gate::JustVerified);
        assert!(!f.machine.has_pending_timer(42));

        sleep_secs(600).await;
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Verified);
        assert!(f.membership.removed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn early_introduction_skips_warning() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.machine.on_member_joined(&newcomer()).await.unwrap();
        sleep_secs(60).await;

        let gate = f.machine.screen_message(&newcomer(), "ok").await.unwrap();
        assert_eq!(gate, Gate::AwaitingIntroduction);
        let gate = f.machine.screen_message(&newcomer(), "Hola!").await.unwrap();
        assert_eq!(gate, Gate::JustVerified);

        sleep_secs(2000).await;
        assert!(f.channel.sent_to(GROUP).is_empty());
        assert!(f.membership.removed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn verified_members_pass_the_gate() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.ledger.touch_activity(&MemberRef::new(7, "Old timer")).await.unwrap();
        let gate = f.machine.screen_message(&MemberRef::new(7, "Old timer"), "anything").await.unwrap();
        assert_eq!(gate, Gate::Open);
        let gate = f.machine.screen_message(&MemberRef::new(8, "Unknown"), "anything").await.unwrap();
        assert_eq!(gate, Gate::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn judge_outage_falls_back_to_word_count() {
        let f = fixture(KeywordJudge::unavailable()).await;
        f.machine.on_member_joined(&newcomer()).await.unwrap();
        assert_eq!(
            f.machine.screen_message(&newcomer(), "hi").await.unwrap(),
            Gate::AwaitingIntroduction
        );
        assert_eq!(
            f.machine.screen_message(&newcomer(), "hi I am Nico").await.unwrap(),
            Gate::JustVerified
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_removal_keeps_member_gated_and_retries() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.membership.fail_removal_of(42, true);
        f.machine.on_member_joined(&newcomer()).await.unwrap();

        sleep_secs(1000).await;
        assert!(f.membership.removed().is_empty());
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Warned);
        assert!(f.machine.has_pending_timer(42));

        // Still in the group and still owing an introduction.
        f.ledger.touch_activity(&newcomer()).await.unwrap();
        let gate = f.machine.screen_message(&newcomer(), "spam spam").await.unwrap();
        assert_eq!(gate, Gate::AwaitingIntroduction);
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Warned);

        f.membership.fail_removal_of(42, false);
        sleep_secs(300).await;
        assert_eq!(f.membership.removed(), vec![42]);
        assert_eq!(f.membership.unbanned(), vec![42]);
        assert!(f.ledger.get(42).await.is_none());
        assert!(!f.machine.has_pending_timer(42));
    }

    #[tokio::test(start_paused = true)]
    async fn introduction_after_failed_removal_still_verifies() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.membership.fail_removal_of(42, true);
        f.machine.on_member_joined(&newcomer()).await.unwrap();
        sleep_secs(1000).await;

        let gate = f.machine.screen_message(&newcomer(), "hola, soy Nico").await.unwrap();
        assert_eq!(gate, Gate::JustVerified);
        assert!(!f.machine.has_pending_timer(42));
        f.membership.fail_removal_of(42, false);
        sleep_secs(3600).await;
        assert!(f.membership.removed().is_empty());
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verification_write_keeps_timers_armed() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.machine.on_member_joined(&newcomer()).await.unwrap();

        f.store.set_fail_writes(true);
        let err = f.machine.screen_message(&newcomer(), "hola soy Nico").await.unwrap_err();
        assert!(matches!(err, CoreError::Persistence { .. }));
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Pending);
        assert!(f.machine.has_pending_timer(42));

        f.store.set_fail_writes(false);
        sleep_secs(3600).await;
        assert_eq!(f.channel.sent_to(GROUP).len(), 2);
        assert_eq!(f.membership.removed(), vec![42]);
        assert!(f.ledger.get(42).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_finishes_an_interrupted_removal() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.ledger.enroll_pending(&newcomer()).await.unwrap();
        f.ledger.set_status(42, VerificationStatus::Removing).await.unwrap();

        assert_eq!(f.machine.resume().await, 1);
        let gate = f.machine.screen_message(&newcomer(), "hola a todos").await.unwrap();
        assert_eq!(gate, Gate::AwaitingIntroduction);
        sleep_secs(301).await;
        assert_eq!(f.membership.removed(), vec![42]);
        assert!(f.ledger.get(42).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_rearms_pending_members() {
        let f = fixture(KeywordJudge::new(["hola"])).await;
        f.ledger.enroll_pending(&newcomer()).await.unwrap();
        assert_eq!(f.machine.resume().await, 1);
        assert!(f.machine.has_pending_timer(42));
        sleep_secs(601).await;
        assert_eq!(f.ledger.get_status(42).await, VerificationStatus::Warned);
    }

    /// Group messages wait until the test lets them through.
    #[derive(Default)]
    struct HeldChannel {
        inner: RecordingChannel,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl NotificationChannel for HeldChannel {
        async fn send_direct_message(&self, member_id: MemberId, text: &str) -> CollaboratorResult<()> {
            self.inner.send_direct_message(member_id, text).await
        }

        async fn send_message(
            &self,
            chat_id: ChatId,
            text: &str,
            keyboard: Option<&Keyboard>,
        ) -> CollaboratorResult<MessageId> {
            self.release.notified().await;
            self.inner.send_message(chat_id, text, keyboard).await
        }

        async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> CollaboratorResult<()> {
            self.inner.pin_message(chat_id, message_id).await
        }

        async fn unpin_message(&self, chat_id: ChatId, message_id: MessageId) -> CollaboratorResult<()> {
            self.inner.unpin_message(chat_id, message_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn introduction_while_warning_is_sent_leaves_no_eviction_armed() {
        let ledger = Arc::new(
            EngagementLedger::open(
                Arc::new(MemoryStore::new(MemberTable::new())),
                LevelTable::standard(),
                XpPolicy::default(),
                Arc::new(SystemClock),
            )
            .await,
        );
        let channel = Arc::new(HeldChannel::default());
        let membership = Arc::new(RecordingMembership::new());
        let machine = VerificationMachine::new(
            ledger.clone(),
            channel.clone(),
            membership.clone(),
            Arc::new(KeywordJudge::new(["hola"])),
            VerificationConfig::new(GROUP),
        );

        machine.on_member_joined(&newcomer()).await.unwrap();
        sleep_secs(601).await;
        // The warning step has marked the member and is stuck sending.
        assert_eq!(ledger.get_status(42).await, VerificationStatus::Warned);
        let gate = machine.screen_message(&newcomer(), "hola, soy Nico").await.unwrap();
        assert_eq!(gate, Gate::JustVerified);

        channel.release.notify_one();
        sleep_secs(1).await;
        assert_eq!(channel.inner.sent_to(GROUP).len(), 1);
        assert!(!machine.has_pending_timer(42));

        sleep_secs(600).await;
        assert!(membership.removed().is_empty());
        assert_eq!(ledger.get_status(42).await, VerificationStatus::Verified);
    }
}
