//! Per-member engagement state: activity recency, XP, level, lives and
//! verification status.
//!
//! Every operation runs inside the member table's critical section, so a
//! cooldown check and the XP increment it guards can never be split by a
//! concurrent grant.

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::leveling::LevelTable;
use crate::member::{MemberId, MemberRef};
use crate::store::{Change, Collection, RecordStore};

pub const STARTING_LIVES: u32 = 3;
pub const DEFAULT_XP_PER_GRANT: u64 = 20;
pub const DEFAULT_XP_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[serde(alias = "pending_presentation")]
    Pending,
    Warned,
    /// Eviction has started; the platform removal has not yet succeeded.
    Removing,
    Verified,
}

/// Records written before verification existed count as verified.
impl Default for VerificationStatus {
    fn default() -> Self {
        Self::Verified
    }
}

impl VerificationStatus {
    pub fn needs_introduction(self) -> bool {
        matches!(self, Self::Pending | Self::Warned | Self::Removing)
    }
}

/// Field aliases cover the first-generation `users.json`, which keyed
/// records by id only and stored naive timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    #[serde(default)]
    pub id: MemberId,
    #[serde(alias = "first_name")]
    pub display_name: String,
    #[serde(default, alias = "username", skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(alias = "join_date", deserialize_with = "timestamp::required")]
    pub joined_at: DateTime<Utc>,
    #[serde(alias = "last_seen", deserialize_with = "timestamp::required")]
    pub last_active_at: DateTime<Utc>,
    #[serde(default = "default_lives")]
    pub lives: u32,
    #[serde(default)]
    pub xp: u64,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default, alias = "last_xp_timestamp", deserialize_with = "timestamp::optional")]
    pub last_xp_grant_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "status")]
    pub verification_status: VerificationStatus,
}

/// Lenient timestamp decoding: RFC 3339, naive ISO 8601 (read as UTC), or
/// fractional unix seconds.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{de::Error, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Epoch(f64),
    }

    fn parse(raw: Raw) -> Option<DateTime<Utc>> {
        match raw {
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| Utc.from_utc_datetime(&naive))
                }),
            Raw::Epoch(secs) if secs.is_finite() && secs >= 0.0 => {
                let whole = secs.trunc() as i64;
                let nanos = ((secs - secs.trunc()) * 1e9) as u32;
                Utc.timestamp_opt(whole, nanos).single()
            }
            Raw::Epoch(_) => None,
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = Raw::deserialize(d)?;
        parse(raw).ok_or_else(|| D::Error::custom("unrecognised timestamp"))
    }

    pub fn optional<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(Option::<Raw>::deserialize(d)?.and_then(parse))
    }
}

fn default_lives() -> u32 {
    STARTING_LIVES
}

fn default_level() -> u32 {
    1
}

impl MemberRecord {
    fn new(member: &MemberRef, now: DateTime<Utc>, status: VerificationStatus) -> Self {
        Self {
            id: member.id,
            display_name: member.display_name.clone(),
            handle: member.handle.clone(),
            joined_at: now,
            last_active_at: now,
            lives: STARTING_LIVES,
            xp: 0,
            level: 1,
            last_xp_grant_at: None,
            verification_status: status,
        }
    }

    pub fn member_ref(&self) -> MemberRef {
        MemberRef {
            id: self.id,
            display_name: self.display_name.clone(),
            handle: self.handle.clone(),
        }
    }

    fn refresh_identity(&mut self, member: &MemberRef) {
        if !member.display_name.trim().is_empty() {
            self.display_name = member.display_name.clone();
        }
        if member.handle.is_some() {
            self.handle = member.handle.clone();
        }
    }
}

/// Member id → record. Serialized with string keys.
pub type MemberTable = BTreeMap<MemberId, MemberRecord>;

#[derive(Debug, Clone, Copy)]
pub struct XpPolicy {
    pub per_grant: u64,
    pub cooldown: Duration,
}

impl Default for XpPolicy {
    fn default() -> Self {
        Self {
            per_grant: DEFAULT_XP_PER_GRANT,
            cooldown: Duration::seconds(DEFAULT_XP_COOLDOWN_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelUpEvent {
    pub member: MemberRef,
    pub old_level: u32,
    pub new_level: u32,
    pub level_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressView {
    pub member: MemberRef,
    pub level: u32,
    pub level_name: String,
    pub xp: u64,
    pub level_floor_xp: u64,
    /// `None` once the last named tier is reached.
    pub next_level_xp: Option<u64>,
    pub lives: u32,
}

impl ProgressView {
    pub fn is_maxed(&self) -> bool {
        self.next_level_xp.is_none()
    }

    /// Fraction of the way from the current floor to the next threshold.
    pub fn ratio(&self) -> f64 {
        match self.next_level_xp {
            None => 1.0,
            Some(next) if next <= self.level_floor_xp => 1.0,
            Some(next) => {
                let span = (next - self.level_floor_xp) as f64;
                let done = self.xp.saturating_sub(self.level_floor_xp) as f64;
                (done / span).clamp(0.0, 1.0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifeLost {
    pub member: MemberRef,
    pub remaining: u32,
}

/// Result of one inactivity pass over the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InactivityPass {
    pub lives_lost: Vec<LifeLost>,
    /// Every record at zero lives, including leftovers of earlier passes.
    pub depleted: Vec<MemberRef>,
}

pub struct EngagementLedger {
    members: Collection<MemberTable>,
    levels: LevelTable,
    policy: XpPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EngagementLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngagementLedger")
            .field("members", &self.members)
            .field("policy", &self.policy)
            .finish()
    }
}

impl EngagementLedger {
    pub async fn open(
        store: Arc<dyn RecordStore<MemberTable>>,
        levels: LevelTable,
        policy: XpPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let members = Collection::open_with("members", store, |table| {
            for (id, record) in table.iter_mut() {
                record.id = *id;
                let (level, _) = levels.level_for_xp(record.xp);
                if record.level != level {
                    debug!(member_id = record.id, cached = record.level, actual = level, "Repairing cached level");
                    record.level = level;
                }
            }
        })
        .await;

        Self {
            members,
            levels,
            policy,
            clock,
        }
    }

    pub fn levels(&self) -> &LevelTable {
        &self.levels
    }

    pub async fn get(&self, member_id: MemberId) -> Option<MemberRecord> {
        self.members.read(|t| t.get(&member_id).cloned()).await
    }

    pub async fn len(&self) -> usize {
        self.members.read(|t| t.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // --- Activity ---

    /// Records that `member` was seen now. Unknown members are created as
    /// verified.
    pub async fn touch_activity(&self, member: &MemberRef) -> CoreResult<MemberRecord> {
        let now = self.clock.now();
        let record = self
            .members
            .update(|t| {
                let record = t
                    .entry(member.id)
                    .and_modify(|r| {
                        r.last_active_at = now;
                        r.refresh_identity(member);
                    })
                    .or_insert_with(|| MemberRecord::new(member, now, VerificationStatus::Verified));
                Ok(Change::Commit(record.clone()))
            })
            .await?;
        debug!(member_id = member.id, "Activity recorded");
        Ok(record)
    }

    /// Puts `member` into the introduction flow, creating the record if
    /// needed.
    pub async fn enroll_pending(&self, member: &MemberRef) -> CoreResult<MemberRecord> {
        let now = self.clock.now();
        let record = self
            .members
            .update(|t| {
                let record = t
                    .entry(member.id)
                    .and_modify(|r| {
                        r.last_active_at = now;
                        r.verification_status = VerificationStatus::Pending;
                        r.refresh_identity(member);
                    })
                    .or_insert_with(|| MemberRecord::new(member, now, VerificationStatus::Pending));
                Ok(Change::Commit(record.clone()))
            })
            .await?;
        info!(member_id = member.id, "Member enrolled pending introduction");
        Ok(record)
    }

    // --- XP ---

    pub async fn grant_xp_if_eligible(&self, member_id: MemberId) -> CoreResult<Option<LevelUpEvent>> {
        let now = self.clock.now();
        let policy = self.policy;
        let levels = &self.levels;

        self.members
            .update(|t| {
                let Some(record) = t.get_mut(&member_id) else {
                    return Ok(Change::Unchanged(None));
                };
                if let Some(last) = record.last_xp_grant_at {
                    if now - last < policy.cooldown {
                        return Ok(Change::Unchanged(None));
                    }
                }

                record.xp += policy.per_grant;
                record.last_xp_grant_at = Some(now);

                let old_level = record.level;
                let (new_level, name) = levels.level_for_xp(record.xp);
                record.level = new_level;

                let event = (new_level > old_level).then(|| LevelUpEvent {
                    member: record.member_ref(),
                    old_level,
                    new_level,
                    level_name: name.to_string(),
                });
                if let Some(ev) = &event {
                    info!(member_id = member_id, old_level = ev.old_level, new_level = ev.new_level, "Level up");
                }
                Ok(Change::Commit(event))
            })
            .await
    }

    /// Bonus XP outside the chat cooldown, e.g. a word game win. Enrolls
    /// the member if needed and returns the new total.
    pub async fn add_points(&self, member: &MemberRef, points: u64) -> CoreResult<(u64, Option<LevelUpEvent>)> {
        let now = self.clock.now();
        let levels = &self.levels;

        self.members
            .update(|t| {
                let record = t
                    .entry(member.id)
                    .or_insert_with(|| MemberRecord::new(member, now, VerificationStatus::Verified));
                record.xp = record.xp.saturating_add(points);

                let old_level = record.level;
                let (new_level, name) = levels.level_for_xp(record.xp);
                record.level = new_level;
                let event = (new_level > old_level).then(|| LevelUpEvent {
                    member: record.member_ref(),
                    old_level,
                    new_level,
                    level_name: name.to_string(),
                });
                info!(member_id = member.id, points = points, total = record.xp, "Bonus points awarded");
                Ok(Change::Commit((record.xp, event)))
            })
            .await
    }

    pub async fn get_progress(&self, member_id: MemberId) -> Option<ProgressView> {
        let record = self.get(member_id).await?;
        let (level, name) = self.levels.level_for_xp(record.xp);
        Some(ProgressView {
            member: record.member_ref(),
            level,
            level_name: name.to_string(),
            xp: record.xp,
            level_floor_xp: self.levels.xp_required(level),
            next_level_xp: self.levels.next_threshold(level),
            lives: record.lives,
        })
    }

    // --- Verification status ---

    pub async fn get_status(&self, member_id: MemberId) -> VerificationStatus {
        self.members
            .read(|t| {
                t.get(&member_id)
                    .map(|r| r.verification_status)
                    .unwrap_or_default()
            })
            .await
    }

    pub async fn set_status(&self, member_id: MemberId, status: VerificationStatus) -> CoreResult<()> {
        self.members
            .update(|t| {
                let record = t
                    .get_mut(&member_id)
                    .ok_or_else(|| CoreError::not_found(format!("member {member_id}")))?;
                if record.verification_status == status {
                    return Ok(Change::Unchanged(()));
                }
                record.verification_status = status;
                Ok(Change::Commit(()))
            })
            .await?;
        info!(member_id = member_id, status = ?status, "Verification status set");
        Ok(())
    }

    /// Marks a pending or warned member verified. Returns false when the
    /// member is not awaiting an introduction, or eviction already started.
    pub async fn complete_introduction(&self, member_id: MemberId) -> CoreResult<bool> {
        self.members
            .update(|t| match t.get_mut(&member_id) {
                Some(record)
                    if matches!(
                        record.verification_status,
                        VerificationStatus::Pending | VerificationStatus::Warned
                    ) =>
                {
                    record.verification_status = VerificationStatus::Verified;
                    Ok(Change::Commit(true))
                }
                _ => Ok(Change::Unchanged(false)),
            })
            .await
    }

    /// Compare-and-set on the verification status. Returns whether the
    /// transition happened.
    pub async fn transition_status(
        &self,
        member_id: MemberId,
        from: VerificationStatus,
        to: VerificationStatus,
    ) -> CoreResult<bool> {
        self.members
            .update(|t| match t.get_mut(&member_id) {
                Some(record) if record.verification_status == from => {
                    record.verification_status = to;
                    Ok(Change::Commit(true))
                }
                _ => Ok(Change::Unchanged(false)),
            })
            .await
    }

    pub async fn members_with_status(&self, status: VerificationStatus) -> Vec<MemberRef> {
        self.members
            .read(|t| {
                t.values()
                    .filter(|r| r.verification_status == status)
                    .map(|r| r.member_ref())
                    .collect()
            })
            .await
    }

    pub async fn sample_verified_members(&self, n: usize) -> Vec<MemberRef> {
        self.members
            .read(|t| {
                let verified: Vec<&MemberRecord> = t
                    .values()
                    .filter(|r| r.verification_status == VerificationStatus::Verified)
                    .collect();
                let mut rng = rand::thread_rng();
                verified
                    .choose_multiple(&mut rng, n)
                    .map(|r| r.member_ref())
                    .collect()
            })
            .await
    }

    // --- Lives & eviction ---

    /// Takes one life and restarts the member's inactivity window.
    pub async fn decrement_life_for_inactivity(&self, member_id: MemberId) -> CoreResult<u32> {
        let now = self.clock.now();
        self.members
            .update(|t| {
                let record = t
                    .get_mut(&member_id)
                    .ok_or_else(|| CoreError::not_found(format!("member {member_id}")))?;
                record.lives = record.lives.saturating_sub(1);
                record.last_active_at = now;
                Ok(Change::Commit(record.lives))
            })
            .await
    }

    /// Decrements every member idle for longer than `threshold`, in one
    /// write. Members already at zero lives are left for eviction and are
    /// not decremented again.
    pub async fn apply_inactivity(&self, threshold: Duration) -> CoreResult<InactivityPass> {
        let now = self.clock.now();
        self.members
            .update(|t| {
                let mut pass = InactivityPass::default();
                for record in t.values_mut() {
                    if record.lives > 0 && now - record.last_active_at > threshold {
                        record.lives -= 1;
                        record.last_active_at = now;
                        pass.lives_lost.push(LifeLost {
                            member: record.member_ref(),
                            remaining: record.lives,
                        });
                    }
                    if record.lives == 0 {
                        pass.depleted.push(record.member_ref());
                    }
                }
                if pass.lives_lost.is_empty() {
                    Ok(Change::Unchanged(pass))
                } else {
                    Ok(Change::Commit(pass))
                }
            })
            .await
    }

    /// Deletes the record. Returns it if it existed.
    pub async fn evict(&self, member_id: MemberId) -> CoreResult<Option<MemberRecord>> {
        let removed = self
            .members
            .update(|t| match t.remove(&member_id) {
                Some(record) => Ok(Change::Commit(Some(record))),
                None => Ok(Change::Unchanged(None)),
            })
            .await?;
        if removed.is_some() {
            info!(member_id = member_id, "Member record deleted");
        }
        Ok(removed)
    }

    /// Deletes the record only if its status is still `expected`.
    pub async fn evict_if_status(
        &self,
        member_id: MemberId,
        expected: VerificationStatus,
    ) -> CoreResult<Option<MemberRecord>> {
        let removed = self
            .members
            .update(|t| {
                let matches = t
                    .get(&member_id)
                    .map(|r| r.verification_status == expected)
                    .unwrap_or(false);
                if !matches {
                    return Ok(Change::Unchanged(None));
                }
                Ok(Change::Commit(t.remove(&member_id)))
            })
            .await?;
        if removed.is_some() {
            info!(member_id = member_id, status = ?expected, "Member record deleted after status check");
        }
        Ok(removed)
    }
}
