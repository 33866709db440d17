//! Daily inactivity pass: idle members lose a life, members out of lives are
//! removed from the group (and immediately unbanned so they may come back).

use chrono::Duration;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::CoreResult;
use crate::ledger::{EngagementLedger, LifeLost};
use crate::member::{ChatId, MemberId};
use crate::platform::{MembershipControl, NotificationChannel};

pub const DEFAULT_INACTIVITY_DAYS: i64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub lives_lost: Vec<LifeLost>,
    pub evicted: Vec<MemberId>,
    /// Still in the group with zero lives; retried on the next sweep.
    pub eviction_failures: Vec<MemberId>,
    pub notification_failures: Vec<MemberId>,
}

pub struct InactivitySweep {
    ledger: Arc<EngagementLedger>,
    notifier: Arc<dyn NotificationChannel>,
    membership: Arc<dyn MembershipControl>,
    group_id: ChatId,
    threshold: Duration,
}

impl std::fmt::Debug for InactivitySweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InactivitySweep")
            .field("group_id", &self.group_id)
            .field("threshold_days", &self.threshold.num_days())
            .finish()
    }
}

impl InactivitySweep {
    pub fn new(
        ledger: Arc<EngagementLedger>,
        notifier: Arc<dyn NotificationChannel>,
        membership: Arc<dyn MembershipControl>,
        group_id: ChatId,
    ) -> Self {
        Self {
            ledger,
            notifier,
            membership,
            group_id,
            threshold: Duration::days(DEFAULT_INACTIVITY_DAYS),
        }
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    /// One full pass. Fails only if the decrements could not be persisted;
    /// platform failures are isolated per member and reported.
    pub async fn run(&self) -> CoreResult<SweepReport> {
        let pass = self.ledger.apply_inactivity(self.threshold).await?;
        let mut report = SweepReport::default();

        for lost in &pass.lives_lost {
            let text = life_lost_message(lost, self.threshold.num_days());
            if let Err(e) = self.notifier.send_direct_message(lost.member.id, &text).await {
                warn!(member_id = lost.member.id, error = %e, "Inactivity notice not delivered");
                report.notification_failures.push(lost.member.id);
            }
        }

        for member in &pass.depleted {
            if let Err(e) = self.membership.remove_member(self.group_id, member.id).await {
                error!(member_id = member.id, error = %e, "Failed to remove inactive member; will retry next sweep");
                report.eviction_failures.push(member.id);
                continue;
            }
            if let Err(e) = self.membership.unban_member(self.group_id, member.id).await {
                warn!(member_id = member.id, error = %e, "Failed to lift ban after inactivity removal");
            }
            match self.ledger.evict(member.id).await {
                Ok(_) => report.evicted.push(member.id),
                Err(e) => {
                    error!(member_id = member.id, error = %e, "Removed member but could not delete record");
                    report.eviction_failures.push(member.id);
                }
            }
        }

        report.lives_lost = pass.lives_lost;
        info!(
            lives_lost = report.lives_lost.len(),
            evicted = report.evicted.len(),
            eviction_failures = report.eviction_failures.len(),
            notification_failures = report.notification_failures.len(),
            "Inactivity sweep finished"
        );
        Ok(report)
    }
}

fn life_lost_message(lost: &LifeLost, days: i64) -> String {
    if lost.remaining == 0 {
        format!(
            "You've been quiet in the group for more than {days} days and ran out of lives, so you'll be removed. You're welcome back any time!"
        )
    } else {
        format!(
            "You've been quiet in the group for more than {days} days, so you lost a life. Lives left: {}. Drop a message to stay in!",
            lost.remaining
        )
    }
}
