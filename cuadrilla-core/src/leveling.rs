//! XP → level progression.
//!
//! Thresholds follow `round(base * level^exponent)`, with level 1 free. Only
//! the named tiers are reachable; past the last one progression caps.

use serde::Serialize;

pub const DEFAULT_BASE_XP: f64 = 100.0;
pub const DEFAULT_EXPONENT: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelTier {
    pub level: u32,
    pub name: String,
    pub xp_required: u64,
}

#[derive(Debug, Clone)]
pub struct LevelTable {
    base: f64,
    exponent: f64,
    /// Sorted by level; thresholds strictly increasing.
    tiers: Vec<LevelTier>,
}

impl Default for LevelTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl LevelTable {
    pub fn standard() -> Self {
        Self::new(
            DEFAULT_BASE_XP,
            DEFAULT_EXPONENT,
            [
                (1, "Newcomer"),
                (2, "Regular"),
                (3, "Familiar Face"),
                (5, "Plan Maker"),
                (7, "Social Butterfly"),
                (10, "Party Starter"),
                (15, "Crew Veteran"),
                (20, "Night Owl"),
                (25, "Event Guru"),
                (30, "Living Legend"),
                (40, "Group Soul"),
                (50, "Immortal"),
                (60, "Deity of the Plans"),
            ],
        )
    }

    pub fn new<'a>(
        base: f64,
        exponent: f64,
        named: impl IntoIterator<Item = (u32, &'a str)>,
    ) -> Self {
        let mut tiers: Vec<LevelTier> = named
            .into_iter()
            .map(|(level, name)| LevelTier {
                level: level.max(1),
                name: name.to_string(),
                xp_required: xp_required_with(base, exponent, level),
            })
            .collect();
        tiers.sort_by_key(|t| t.level);
        tiers.dedup_by_key(|t| t.level);
        if tiers.first().map(|t| t.level) != Some(1) {
            tiers.insert(
                0,
                LevelTier {
                    level: 1,
                    name: "Newcomer".to_string(),
                    xp_required: 0,
                },
            );
        }
        Self {
            base,
            exponent,
            tiers,
        }
    }

    pub fn tiers(&self) -> &[LevelTier] {
        &self.tiers
    }

    pub fn xp_required(&self, level: u32) -> u64 {
        xp_required_with(self.base, self.exponent, level)
    }

    /// Highest named tier whose threshold `xp` reaches.
    pub fn level_for_xp(&self, xp: u64) -> (u32, &str) {
        let tier = self.tier_for_xp(xp);
        (tier.level, tier.name.as_str())
    }

    fn tier_for_xp(&self, xp: u64) -> &LevelTier {
        let mut current = &self.tiers[0];
        for tier in &self.tiers {
            if xp >= tier.xp_required {
                current = tier;
            } else {
                break;
            }
        }
        current
    }

    /// Name of the tier `level` falls in.
    pub fn name_for(&self, level: u32) -> &str {
        self.tiers
            .iter()
            .take_while(|t| t.level <= level)
            .last()
            .map(|t| t.name.as_str())
            .unwrap_or_else(|| self.tiers[0].name.as_str())
    }

    /// Threshold of the next named tier above `level`, or `None` once capped.
    pub fn next_threshold(&self, level: u32) -> Option<u64> {
        self.tiers
            .iter()
            .find(|t| t.level > level)
            .map(|t| t.xp_required)
    }
}

fn xp_required_with(base: f64, exponent: f64, level: u32) -> u64 {
    if level <= 1 {
        return 0;
    }
    (base * f64::from(level).powf(exponent)).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_follow_the_curve() {
        let table = LevelTable::standard();
        assert_eq!(table.xp_required(0), 0);
        assert_eq!(table.xp_required(1), 0);
        assert_eq!(table.xp_required(2), 283);
        assert_eq!(table.xp_required(3), 520);
        assert_eq!(table.xp_required(5), 1118);
        assert_eq!(table.xp_required(10), 3162);
        assert_eq!(table.xp_required(60), 46476);
    }

    #[test]
    fn thresholds_strictly_increase() {
        let table = LevelTable::standard();
        for pair in table.tiers().windows(2) {
            assert!(pair[0].xp_required < pair[1].xp_required);
        }
    }

    #[test]
    fn level_for_xp_takes_highest_reached() {
        let table = LevelTable::standard();
        assert_eq!(table.level_for_xp(0).0, 1);
        assert_eq!(table.level_for_xp(282).0, 1);
        assert_eq!(table.level_for_xp(283).0, 2);
        assert_eq!(table.level_for_xp(1117).0, 3);
        assert_eq!(table.level_for_xp(1118), (5, "Plan Maker"));
        assert_eq!(table.level_for_xp(u64::MAX).0, 60);
    }

    #[test]
    fn next_threshold_skips_to_next_named_tier() {
        let table = LevelTable::standard();
        assert_eq!(table.next_threshold(1), Some(283));
        assert_eq!(table.next_threshold(3), Some(1118));
        assert_eq!(table.next_threshold(4), Some(1118));
        assert_eq!(table.next_threshold(50), Some(46476));
        assert_eq!(table.next_threshold(60), None);
    }

    #[test]
    fn name_for_unnamed_level_uses_enclosing_tier() {
        let table = LevelTable::standard();
        assert_eq!(table.name_for(4), "Familiar Face");
        assert_eq!(table.name_for(60), "Deity of the Plans");
    }
}
