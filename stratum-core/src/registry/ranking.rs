//! Pure scoring and ranking over planner metadata.
//!
//! Nothing here touches registry state; callers pass detached
//! [`PlannerSummary`] copies and get a fully ordered list back.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::planner::PlannerTier;

use super::models::PlannerSummary;

pub const MATCH_WEIGHT: f64 = 1.0;
pub const RELIABILITY_WEIGHT: f64 = 0.5;
pub const TIER_BONUS_EXPERIMENTAL: f64 = 0.0;
pub const TIER_BONUS_BETA: f64 = 0.1;
pub const TIER_BONUS_STABLE: f64 = 0.2;
pub const PRODUCTION_READY_BONUS: f64 = 0.1;
pub const COMPLEXITY_WEIGHT: f64 = 0.05;
pub const COMPLEXITY_SATURATION_CHARS: usize = 400;
/// Largest contribution a candidate can earn outside of capability match.
/// Subtracting it from partial matches keeps them below any full match.
pub const INCOMPLETE_COVERAGE_PENALTY: f64 =
    RELIABILITY_WEIGHT + TIER_BONUS_STABLE + PRODUCTION_READY_BONUS + COMPLEXITY_WEIGHT;

pub const HOTSPOT_BOOST_PER_HOTSPOT: f64 = 0.01;
pub const HOTSPOT_BOOST_CAP: f64 = 0.1;
pub const STRUCTURE_MULTIPLIER: f64 = 1.05;
pub const CAPABILITY_HINT_BOOST: f64 = 0.03;
pub const CAPABILITY_HINT_BOOST_CAP: f64 = 0.06;

/// Optional project-level context a caller can attach to a selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeepContext {
    #[serde(default)]
    pub project_summary: Option<String>,
    #[serde(default)]
    pub hotspot_count: usize,
    #[serde(default)]
    pub capability_hints: BTreeSet<String>,
}

impl DeepContext {
    pub fn has_structure(&self) -> bool {
        self.project_summary
            .as_deref()
            .map(|summary| !summary.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankOptions {
    pub min_reliability: f64,
    pub strict_capabilities: bool,
    pub use_deep_context: bool,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            min_reliability: 0.0,
            strict_capabilities: false,
            use_deep_context: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedPlanner {
    pub name: String,
    pub score: f64,
    pub rank_hint: f64,
    pub match_ratio: f64,
    pub production_ready: bool,
    pub breakdown: BTreeMap<String, f64>,
}

impl RankedPlanner {
    pub fn fully_capable(&self) -> bool {
        self.match_ratio >= 1.0
    }
}

pub fn capabilities_match_ratio(required: &BTreeSet<String>, offered: &BTreeSet<String>) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let matched = required.intersection(offered).count();
    matched as f64 / required.len() as f64
}

pub fn tier_bonus(tier: PlannerTier) -> f64 {
    match tier {
        PlannerTier::Experimental => TIER_BONUS_EXPERIMENTAL,
        PlannerTier::Beta => TIER_BONUS_BETA,
        PlannerTier::Stable => TIER_BONUS_STABLE,
    }
}

pub fn compute_rank_hint(
    objective_length: usize,
    match_ratio: f64,
    reliability_score: f64,
    tier: PlannerTier,
    production_ready: bool,
) -> f64 {
    let match_ratio = match_ratio.clamp(0.0, 1.0);
    let reliability = reliability_score.clamp(0.0, 1.0);
    let complexity = (objective_length as f64 / COMPLEXITY_SATURATION_CHARS as f64).min(1.0);
    // long objectives lean towards mature tiers
    let complexity_bonus = COMPLEXITY_WEIGHT * complexity * f64::from(tier.ordinal()) / 2.0;
    let production_bonus = if production_ready {
        PRODUCTION_READY_BONUS
    } else {
        0.0
    };
    let coverage_penalty = if match_ratio < 1.0 {
        INCOMPLETE_COVERAGE_PENALTY
    } else {
        0.0
    };

    let score = match_ratio * MATCH_WEIGHT
        + reliability * RELIABILITY_WEIGHT
        + tier_bonus(tier)
        + production_bonus
        + complexity_bonus
        - coverage_penalty;
    score.max(0.0)
}

/// Applies context boosts to `base_score`. Without context the score passes through
/// unchanged with an empty breakdown.
pub fn compute_deep_boosts(
    base_score: f64,
    deep_context: Option<&DeepContext>,
) -> (f64, BTreeMap<String, f64>) {
    let mut breakdown = BTreeMap::new();
    let Some(context) = deep_context else {
        return (base_score, breakdown);
    };

    let hotspot_boost =
        (context.hotspot_count as f64 * HOTSPOT_BOOST_PER_HOTSPOT).min(HOTSPOT_BOOST_CAP);
    if hotspot_boost > 0.0 {
        breakdown.insert("hotspot_boost".to_string(), hotspot_boost);
    }
    let multiplier = if context.has_structure() {
        breakdown.insert("structure_multiplier".to_string(), STRUCTURE_MULTIPLIER);
        STRUCTURE_MULTIPLIER
    } else {
        1.0
    };
    ((base_score + hotspot_boost) * multiplier, breakdown)
}

fn capability_hint_boost(context: &DeepContext, offered: &BTreeSet<String>) -> f64 {
    let hinted = context.capability_hints.intersection(offered).count();
    (hinted as f64 * CAPABILITY_HINT_BOOST).min(CAPABILITY_HINT_BOOST_CAP)
}

/// Scores every eligible candidate and orders them best first.
///
/// Eligible means active and at or above `min_reliability` (and fully capable in
/// strict mode). Equal scores are ordered by name so identical inputs always give
/// identical output.
pub fn rank_planners(
    candidates: &[PlannerSummary],
    objective: &str,
    required_capabilities: &BTreeSet<String>,
    deep_context: Option<&DeepContext>,
    options: &RankOptions,
) -> Vec<RankedPlanner> {
    let objective_length = objective.chars().count();
    let deep_context = deep_context.filter(|_| options.use_deep_context);

    let mut ranked: Vec<RankedPlanner> = candidates
        .iter()
        .filter(|candidate| candidate.is_active())
        .filter(|candidate| candidate.reliability_score >= options.min_reliability)
        .filter_map(|candidate| {
            let match_ratio =
                capabilities_match_ratio(required_capabilities, &candidate.capabilities);
            if options.strict_capabilities && match_ratio < 1.0 {
                return None;
            }
            let rank_hint = compute_rank_hint(
                objective_length,
                match_ratio,
                candidate.reliability_score,
                candidate.tier,
                candidate.production_ready,
            );
            let (score, breakdown) = compute_deep_boosts(rank_hint, deep_context);
            let mut entry = RankedPlanner {
                name: candidate.name.clone(),
                score,
                rank_hint,
                match_ratio,
                production_ready: candidate.production_ready,
                breakdown,
            };
            if let Some(context) = deep_context.filter(|_| entry.fully_capable()) {
                let boost = capability_hint_boost(context, &candidate.capabilities);
                if boost > 0.0 {
                    entry.breakdown.insert("capability_hint_boost".to_string(), boost);
                    entry.score += boost;
                }
            }
            entry.breakdown.insert("rank_hint".to_string(), rank_hint);
            entry.breakdown.insert("match_ratio".to_string(), match_ratio);
            Some(entry)
        })
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::models::PlannerStatus;
    use chrono::Utc;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|tag| tag.to_string()).collect()
    }

    fn summary(name: &str, tags: &[&str], reliability: f64, tier: PlannerTier) -> PlannerSummary {
        PlannerSummary {
            name: name.to_string(),
            module_path: format!("builtin:{name}"),
            capabilities: caps(tags),
            reliability_score: reliability,
            tier,
            production_ready: false,
            status: PlannerStatus::Active,
            last_error: None,
            description: None,
            fingerprint: None,
            failure_count: 0,
            discovered_at: Utc::now(),
            last_checked_at: Utc::now(),
        }
    }

    #[test]
    fn empty_requirement_is_a_vacuous_match() {
        assert_eq!(capabilities_match_ratio(&caps(&[]), &caps(&[])), 1.0);
        assert_eq!(capabilities_match_ratio(&caps(&[]), &caps(&["x"])), 1.0);
    }

    #[test]
    fn match_ratio_is_one_only_for_subsets() {
        let offered = caps(&["x", "y", "z"]);
        assert_eq!(capabilities_match_ratio(&caps(&["x", "z"]), &offered), 1.0);
        assert_eq!(capabilities_match_ratio(&caps(&["x", "w"]), &offered), 0.5);
        assert!(capabilities_match_ratio(&caps(&["w"]), &offered) < 1.0);
    }

    #[test]
    fn partial_match_never_beats_full_match() {
        let worst_full = compute_rank_hint(0, 1.0, 0.0, PlannerTier::Experimental, false);
        for ratio in [0.0, 0.25, 0.5, 0.9, 0.999] {
            let best_partial = compute_rank_hint(10_000, ratio, 1.0, PlannerTier::Stable, true);
            assert!(
                best_partial < worst_full,
                "ratio {ratio}: {best_partial} >= {worst_full}"
            );
        }
    }

    #[test]
    fn tier_and_production_contribute_fixed_bonuses() {
        let experimental = compute_rank_hint(0, 1.0, 0.5, PlannerTier::Experimental, false);
        let beta = compute_rank_hint(0, 1.0, 0.5, PlannerTier::Beta, false);
        let stable = compute_rank_hint(0, 1.0, 0.5, PlannerTier::Stable, false);
        let stable_prod = compute_rank_hint(0, 1.0, 0.5, PlannerTier::Stable, true);
        assert!(stable > beta && beta > experimental);
        assert!((stable_prod - stable - PRODUCTION_READY_BONUS).abs() < 1e-12);
    }

    #[test]
    fn deep_boosts_pass_through_without_context() {
        let (score, breakdown) = compute_deep_boosts(1.2, None);
        assert_eq!(score, 1.2);
        assert!(breakdown.is_empty());
    }

    #[test]
    fn deep_boosts_are_bounded_and_named() {
        let context = DeepContext {
            project_summary: Some("cargo workspace, 3 crates".into()),
            hotspot_count: 500,
            capability_hints: BTreeSet::new(),
        };
        let (score, breakdown) = compute_deep_boosts(1.0, Some(&context));
        assert_eq!(breakdown["hotspot_boost"], HOTSPOT_BOOST_CAP);
        assert_eq!(breakdown["structure_multiplier"], STRUCTURE_MULTIPLIER);
        assert!((score - (1.0 + HOTSPOT_BOOST_CAP) * STRUCTURE_MULTIPLIER).abs() < 1e-12);
    }

    #[test]
    fn ties_break_by_name() {
        let candidates = vec![
            summary("zeta", &["x"], 0.8, PlannerTier::Beta),
            summary("alpha", &["x"], 0.8, PlannerTier::Beta),
            summary("mid", &["x"], 0.8, PlannerTier::Beta),
        ];
        let ranked = rank_planners(&candidates, "plan", &caps(&["x"]), None, &RankOptions::default());
        let names: Vec<&str> = ranked.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn filters_quarantined_and_unreliable() {
        let mut quarantined = summary("q", &["x"], 0.9, PlannerTier::Stable);
        quarantined.status = PlannerStatus::Quarantined;
        let candidates = vec![
            quarantined,
            summary("weak", &["x"], 0.1, PlannerTier::Stable),
            summary("ok", &["x"], 0.5, PlannerTier::Experimental),
        ];
        let options = RankOptions {
            min_reliability: 0.3,
            ..RankOptions::default()
        };
        let ranked = rank_planners(&candidates, "plan", &caps(&["x"]), None, &options);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "ok");
    }

    #[test]
    fn scenario_capability_gap_decides() {
        let candidates = vec![
            summary("A", &["x", "y"], 0.9, PlannerTier::Stable),
            summary("B", &["x"], 0.95, PlannerTier::Experimental),
        ];
        let both = rank_planners(&candidates, "...", &caps(&["x", "y"]), None, &RankOptions::default());
        assert_eq!(both[0].name, "A");
        assert!(both[1].match_ratio < 1.0);

        let only_x = rank_planners(&candidates, "...", &caps(&["x"]), None, &RankOptions::default());
        let again = rank_planners(&candidates, "...", &caps(&["x"]), None, &RankOptions::default());
        assert_eq!(only_x, again);
        // stable tier outweighs the 0.05 reliability gap
        assert_eq!(only_x[0].name, "A");
    }

    #[test]
    fn strict_mode_drops_partial_matches() {
        let candidates = vec![
            summary("A", &["x", "y"], 0.9, PlannerTier::Stable),
            summary("B", &["x"], 0.95, PlannerTier::Experimental),
        ];
        let options = RankOptions {
            strict_capabilities: true,
            ..RankOptions::default()
        };
        let ranked = rank_planners(&candidates, "...", &caps(&["x", "y"]), None, &options);
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn capability_hints_favour_matching_candidates() {
        let candidates = vec![
            summary("plain", &["x"], 0.8, PlannerTier::Beta),
            summary("hinted", &["x", "refactor"], 0.8, PlannerTier::Beta),
        ];
        let context = DeepContext {
            capability_hints: caps(&["refactor"]),
            ..DeepContext::default()
        };
        let ranked = rank_planners(&candidates, "plan", &caps(&["x"]), Some(&context), &RankOptions::default());
        assert_eq!(ranked[0].name, "hinted");
        assert_eq!(ranked[0].breakdown["capability_hint_boost"], CAPABILITY_HINT_BOOST);

        let disabled = RankOptions {
            use_deep_context: false,
            ..RankOptions::default()
        };
        let ranked = rank_planners(&candidates, "plan", &caps(&["x"]), Some(&context), &disabled);
        assert!(ranked
            .iter()
            .all(|entry| !entry.breakdown.contains_key("capability_hint_boost")));
        assert_eq!(ranked[0].score, ranked[1].score);
    }

    #[test]
    fn capability_hints_skip_partial_matches() {
        let candidates = vec![summary("partial", &["x", "refactor"], 0.8, PlannerTier::Beta)];
        let context = DeepContext {
            capability_hints: caps(&["refactor"]),
            ..DeepContext::default()
        };
        let ranked = rank_planners(&candidates, "plan", &caps(&["x", "y"]), Some(&context), &RankOptions::default());
        assert!(!ranked[0].fully_capable());
        assert!(!ranked[0].breakdown.contains_key("capability_hint_boost"));
    }
}
