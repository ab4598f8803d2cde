// Domain rows and output structures for the evaluation core.
//
// The engine works with primitive-typed rows (i64 ids, chrono timestamps)
// so it can sit behind any storage adapter. Output structs are what the
// HTTP/RPC layer serializes to clients; they derive PartialEq so idempotence
// checks are plain structural equality.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// ENUMS
// ============================================================================

/// Time bucket a variable's values collapse into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableGroup {
    Year,
    Month,
    Week,
    Day,
    None,
}

impl VariableGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableGroup::Year => "year",
            VariableGroup::Month => "month",
            VariableGroup::Week => "week",
            VariableGroup::Day => "day",
            VariableGroup::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "year" => Some(VariableGroup::Year),
            "month" => Some(VariableGroup::Month),
            "week" => Some(VariableGroup::Week),
            "day" => Some(VariableGroup::Day),
            "none" => Some(VariableGroup::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncreasePermission {
    Own,
    Admin,
}

impl IncreasePermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncreasePermission::Own => "own",
            IncreasePermission::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "own" => Some(IncreasePermission::Own),
            "admin" => Some(IncreasePermission::Admin),
            _ => None,
        }
    }
}

/// Who an achievement's leaderboard cohort is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    Friends,
    City,
    Own,
}

impl Relevance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relevance::Friends => "friends",
            Relevance::City => "city",
            Relevance::Own => "own",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "friends" => Some(Relevance::Friends),
            "city" => Some(Relevance::City),
            "own" => Some(Relevance::Own),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewPermission {
    Everyone,
    Own,
}

impl ViewPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewPermission::Everyone => "everyone",
            ViewPermission::Own => "own",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "everyone" => Some(ViewPermission::Everyone),
            "own" => Some(ViewPermission::Own),
            _ => None,
        }
    }
}

/// Evaluation cadence of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Evaluation {
    Immediately,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    End,
}

impl Evaluation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Evaluation::Immediately => "immediately",
            Evaluation::Daily => "daily",
            Evaluation::Weekly => "weekly",
            Evaluation::Monthly => "monthly",
            Evaluation::Yearly => "yearly",
            Evaluation::End => "end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "immediately" => Some(Evaluation::Immediately),
            "daily" => Some(Evaluation::Daily),
            "weekly" => Some(Evaluation::Weekly),
            "monthly" => Some(Evaluation::Monthly),
            "yearly" => Some(Evaluation::Yearly),
            "end" => Some(Evaluation::End),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalOperator {
    Geq,
    Leq,
}

impl GoalOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalOperator::Geq => "geq",
            GoalOperator::Leq => "leq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "geq" => Some(GoalOperator::Geq),
            "leq" => Some(GoalOperator::Leq),
            _ => None,
        }
    }
}

/// Which group aggregate represents the user when grouping is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxMin {
    Max,
    Min,
}

impl MaxMin {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaxMin::Max => "max",
            MaxMin::Min => "min",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "max" => Some(MaxMin::Max),
            "min" => Some(MaxMin::Min),
            _ => None,
        }
    }
}

// ============================================================================
// ROWS
// ============================================================================

/// A participant: timezone and optional location drive time- and geo-aware
/// evaluation; friends and groups drive cohorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub timezone: String,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    /// A bare user row, as created when a friend reference points at an
    /// id we have never seen.
    pub fn bare(id: i64, now: DateTime<Utc>) -> Self {
        UserRow {
            id,
            lat: None,
            lng: None,
            timezone: "UTC".to_string(),
            country: None,
            region: None,
            city: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRow {
    pub id: i32,
    pub name: String,
    pub group: VariableGroup,
    pub increase_permission: IncreasePermission,
}

/// One stored observation, joined with its variable's name: the shape the
/// progress fold consumes (conditions bind `variable_name` and `key` per
/// row). Identity in the store is `(user, variable, datetime, key)`;
/// increments with the same identity collapse by addition at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct UserValueRow {
    pub variable_id: i32,
    pub variable_name: String,
    pub datetime: DateTime<Utc>,
    pub key: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementCategoryRow {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementRow {
    pub id: i32,
    pub name: String,
    pub category_id: Option<i32>,
    pub maxlevel: i32,
    pub hidden: bool,
    pub valid_start: Option<NaiveDate>,
    pub valid_end: Option<NaiveDate>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub max_distance: Option<i32>,
    pub priority: i32,
    pub relevance: Relevance,
    pub view_permission: ViewPermission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalRow {
    pub id: i32,
    pub name: String,
    pub name_translation_id: Option<i32>,
    pub condition: Option<String>,
    pub evaluation: Evaluation,
    pub timespan: Option<i32>,
    pub group_by_key: bool,
    pub group_by_dateformat: Option<String>,
    pub goal: Option<String>,
    pub operator: Option<GoalOperator>,
    pub maxmin: MaxMin,
    pub achievement_id: i32,
    pub priority: i32,
}

/// Reward definition joined with its per-achievement value row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementRewardRow {
    /// id of the achievement<->reward association row
    pub id: i32,
    pub reward_id: i32,
    pub name: String,
    pub from_level: i32,
    pub value: Option<String>,
    pub value_translation_id: Option<i32>,
}

/// Property definition joined with its per-achievement value row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementPropertyRow {
    pub property_id: i32,
    pub name: String,
    pub is_variable: bool,
    pub from_level: i32,
    pub value: Option<String>,
    pub value_translation_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalPropertyRow {
    pub property_id: i32,
    pub name: String,
    pub is_variable: bool,
    pub from_level: i32,
    pub value: Option<String>,
    pub value_translation_id: Option<i32>,
}

/// Standalone property definition (the catalog side of the
/// auto-materialization hook).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementPropertyDef {
    pub id: i32,
    pub name: String,
    pub is_variable: bool,
}

/// One awarded level. Historical trail: a row per level, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementLevelRow {
    pub user_id: i64,
    pub achievement_id: i32,
    pub level: i32,
    pub awarded_at: DateTime<Utc>,
}

/// Durable mirror of the goal evaluation memo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalCacheRow {
    pub goal_id: i32,
    pub user_id: i64,
    pub value: f64,
    pub achieved: bool,
}

// ============================================================================
// OUTPUTS
// ============================================================================

/// Map from language name to rendered text, as produced by `trs`.
pub type TranslatedText = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardOutput {
    pub id: i32,
    pub reward_id: i32,
    pub name: String,
    pub value: Option<String>,
    pub value_translated: Option<TranslatedText>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyOutput {
    pub property_id: i32,
    pub name: String,
    pub is_variable: bool,
    pub value: Option<String>,
    pub value_translated: Option<TranslatedText>,
}

/// Rendered per-level view of a goal: threshold and translated name at a
/// concrete level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalBasicOutput {
    pub goal_id: i32,
    pub goal_name: Option<TranslatedText>,
    pub goal_goal: Option<f64>,
    pub priority: i32,
    pub properties: BTreeMap<String, PropertyOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub value: f64,
    pub position: usize,
}

/// The cached record returned for a goal: rendered basic output plus the
/// evaluation result, and leaderboard data when the achievement is social.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalEvaluation {
    #[serde(flatten)]
    pub basic: GoalBasicOutput,
    pub achieved: bool,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaderboard: Option<Vec<LeaderboardEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaderboard_position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelOutput {
    pub level: i32,
    pub goals: BTreeMap<String, GoalBasicOutput>,
    pub rewards: BTreeMap<String, RewardOutput>,
    pub properties: BTreeMap<String, PropertyOutput>,
}

/// Rewards and properties materialized when a level was awarded in the
/// current call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewLevelOutput {
    pub level: i32,
    pub rewards: BTreeMap<String, RewardOutput>,
    pub properties: BTreeMap<String, PropertyOutput>,
}

/// Full evaluation state of an achievement for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AchievementState {
    pub id: i32,
    pub internal_name: String,
    pub view_permission: ViewPermission,
    pub maxlevel: i32,
    pub priority: i32,
    pub hidden: bool,
    pub achievementcategory: String,
    pub level: i32,
    /// level -> timestamp of the award
    pub levels_achieved: BTreeMap<String, DateTime<Utc>>,
    /// level -> rendered goals/rewards/properties, up to `level + 1`
    pub levels: BTreeMap<String, LevelOutput>,
    /// goal id -> evaluation record
    pub goals: BTreeMap<String, GoalEvaluation>,
    /// levels awarded during this evaluation call
    pub new_levels: BTreeMap<String, NewLevelOutput>,
}

/// An achievement that is visible for a user today, with the distance to
/// its location when it has one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AchievementToday {
    pub achievement: AchievementRow,
    pub distance: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_evaluation_serializes_flat() {
        let eval = GoalEvaluation {
            basic: GoalBasicOutput {
                goal_id: 7,
                goal_name: None,
                goal_goal: Some(200.0),
                priority: 3,
                properties: BTreeMap::new(),
            },
            achieved: true,
            value: 200.0,
            leaderboard: None,
            leaderboard_position: None,
        };

        let json = serde_json::to_value(&eval).unwrap();
        // basic output fields are flattened into the record
        assert_eq!(json["goal_id"], 7);
        assert_eq!(json["goal_goal"], 200.0);
        assert_eq!(json["achieved"], true);
        // absent leaderboard data is omitted entirely
        assert!(json.get("leaderboard").is_none());
        assert!(json.get("leaderboard_position").is_none());
    }

    #[test]
    fn test_enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Relevance::Friends).unwrap(), "\"friends\"");
        assert_eq!(
            serde_json::to_string(&Evaluation::Immediately).unwrap(),
            "\"immediately\""
        );
        assert_eq!(serde_json::to_string(&VariableGroup::Day).unwrap(), "\"day\"");
        assert_eq!(serde_json::to_string(&GoalOperator::Geq).unwrap(), "\"geq\"");
    }

    #[test]
    fn test_enum_string_mapping_roundtrips() {
        for group in [
            VariableGroup::Year,
            VariableGroup::Month,
            VariableGroup::Week,
            VariableGroup::Day,
            VariableGroup::None,
        ] {
            assert_eq!(VariableGroup::parse(group.as_str()), Some(group));
        }
        for evaluation in [
            Evaluation::Immediately,
            Evaluation::Daily,
            Evaluation::Weekly,
            Evaluation::Monthly,
            Evaluation::Yearly,
            Evaluation::End,
        ] {
            assert_eq!(Evaluation::parse(evaluation.as_str()), Some(evaluation));
        }
        for relevance in [Relevance::Friends, Relevance::City, Relevance::Own] {
            assert_eq!(Relevance::parse(relevance.as_str()), Some(relevance));
        }
        assert_eq!(MaxMin::parse("min"), Some(MaxMin::Min));
        assert_eq!(GoalOperator::parse("nope"), None);
    }
}
