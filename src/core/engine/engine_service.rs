// This is the evaluation core - it contains ALL the business logic that
// turns raw value increments into achievement-level progression.
//
// The service works against the GameStore port with primitive types, so it
// can sit behind any HTTP/RPC frontend and any storage adapter. Memoization
// lives here as process-local dashmaps; the durable goal cache is mirrored
// through the store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[path = "models.rs"]
pub mod models;
#[path = "progress.rs"]
pub mod progress;
#[path = "store.rs"]
pub mod store;
#[path = "time_buckets.rs"]
pub mod time_buckets;

use crate::core::expr::{self, ExprValue, Expression, ExpressionError, Params};
use crate::core::translation;
use models::{
    AchievementLevelRow, AchievementPropertyDef, AchievementPropertyRow, AchievementRewardRow,
    AchievementRow, AchievementState, AchievementToday, GoalBasicOutput, GoalCacheRow,
    GoalEvaluation, GoalOperator, GoalRow, IncreasePermission, LeaderboardEntry, LevelOutput,
    NewLevelOutput, PropertyOutput, Relevance, RewardOutput, TranslatedText, UserRow,
    VariableGroup, VariableRow,
};
use store::{GameStore, StoreError};

/// Permission name checked for catalog-wide value increases.
pub const PERM_GLOBAL_INCREASE_VALUE: &str = "global_increase_value";

// ============================================================================
// ERRORS & SETTINGS
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Unknown user: {0}")]
    UnknownUser(i64),

    #[error("Unknown achievement: {0}")]
    UnknownAchievement(i32),

    #[error("Permission denied")]
    PermissionDenied,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The authenticated subject of a request, as the surrounding HTTP layer
/// sees it. Consumed, never produced, by the engine.
pub trait PermissionContext: Send + Sync {
    fn has_perm(&self, permission: &str) -> bool;
    fn user_id(&self) -> Option<i64>;
}

/// Engine configuration supplied by the caller.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// When false the `may_increase` gate is disabled entirely.
    pub enable_user_authentication: bool,
    pub fallback_language: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enable_user_authentication: false,
            fallback_language: "en".to_string(),
        }
    }
}

// ============================================================================
// CACHES
// ============================================================================

/// One entry of the variable->rules reverse index.
#[derive(Debug, Clone)]
struct VariableRule {
    goal: GoalRow,
    achievement: AchievementRow,
}

/// Process-local memo caches. Writers only ever invalidate; the compute
/// paths are the only setters.
struct EngineCaches {
    goal_eval: DashMap<(i32, i64), GoalEvaluation>,
    achievement_eval: DashMap<(i64, i32), AchievementState>,
    levels: DashMap<(i64, i32), Arc<Vec<AchievementLevelRow>>>,
    variables_by_name: DashMap<String, VariableRow>,
    today: DashMap<i64, (DateTime<Utc>, Arc<Vec<AchievementToday>>)>,
    translations: DashMap<i32, Arc<Vec<(String, String)>>>,
    rules_by_variable: RwLock<Option<Arc<HashMap<i32, Vec<VariableRule>>>>>,
    languages: RwLock<Option<Arc<Vec<String>>>>,
}

impl EngineCaches {
    fn new() -> Self {
        Self {
            goal_eval: DashMap::new(),
            achievement_eval: DashMap::new(),
            levels: DashMap::new(),
            variables_by_name: DashMap::new(),
            today: DashMap::new(),
            translations: DashMap::new(),
            rules_by_variable: RwLock::new(None),
            languages: RwLock::new(None),
        }
    }
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct GamificationService<S: GameStore> {
    store: S,
    settings: EngineSettings,
    caches: EngineCaches,
}

impl<S: GameStore> GamificationService<S> {
    pub fn new(store: S) -> Self {
        Self::with_settings(store, EngineSettings::default())
    }

    pub fn with_settings(store: S, settings: EngineSettings) -> Self {
        Self {
            store,
            settings,
            caches: EngineCaches::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn require_user(&self, user_id: i64) -> Result<UserRow, EngineError> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or(EngineError::UnknownUser(user_id))
    }

    async fn require_achievement(&self, achievement_id: i32) -> Result<AchievementRow, EngineError> {
        self.store
            .get_achievement(achievement_id)
            .await?
            .ok_or(EngineError::UnknownAchievement(achievement_id))
    }

    // ------------------------------------------------------------------
    // values
    // ------------------------------------------------------------------

    /// Increase the value of a variable for a user, collapsing into the
    /// variable's time bucket, then fan out cache invalidation.
    pub async fn increase_value(
        &self,
        variable_name: &str,
        user_id: i64,
        amount: i64,
        key: &str,
    ) -> Result<(), EngineError> {
        let user = self.require_user(user_id).await?;
        self.increase_value_for_user(variable_name, &user, amount, key)
            .await
    }

    /// Same as `increase_value`, guarded by the `may_increase` gate.
    pub async fn increase_value_checked(
        &self,
        ctx: &dyn PermissionContext,
        variable_name: &str,
        user_id: i64,
        amount: i64,
        key: &str,
    ) -> Result<(), EngineError> {
        let variable = self
            .variable_by_name(variable_name)
            .await?
            .ok_or_else(|| EngineError::UnknownVariable(variable_name.to_string()))?;
        if !self.may_increase(&variable, ctx, user_id) {
            return Err(EngineError::PermissionDenied);
        }
        self.increase_value(variable_name, user_id, amount, key)
            .await
    }

    /// Whether the request subject may increase this variable for `user_id`.
    pub fn may_increase(
        &self,
        variable: &VariableRow,
        ctx: &dyn PermissionContext,
        user_id: i64,
    ) -> bool {
        if !self.settings.enable_user_authentication {
            return true;
        }
        if ctx.has_perm(PERM_GLOBAL_INCREASE_VALUE) {
            return true;
        }
        variable.increase_permission == IncreasePermission::Own && ctx.user_id() == Some(user_id)
    }

    async fn increase_value_for_user(
        &self,
        variable_name: &str,
        user: &UserRow,
        amount: i64,
        key: &str,
    ) -> Result<(), EngineError> {
        let variable = self
            .variable_by_name(variable_name)
            .await?
            .ok_or_else(|| EngineError::UnknownVariable(variable_name.to_string()))?;

        let tz = time_buckets::parse_timezone(&user.timezone);
        let bucket = time_buckets::bucket_datetime(tz, variable.group, Utc::now());

        self.store
            .add_value(user.id, variable.id, bucket, key, amount)
            .await?;
        tracing::debug!(
            variable = %variable.name,
            user_id = user.id,
            amount,
            "value increased"
        );

        self.invalidate_caches_for_variable_and_user(&variable, user.id)
            .await
    }

    async fn variable_by_name(&self, name: &str) -> Result<Option<VariableRow>, EngineError> {
        if let Some(hit) = self.caches.variables_by_name.get(name) {
            return Ok(Some(hit.clone()));
        }
        let row = self.store.variable_by_name(name).await?;
        if let Some(v) = &row {
            self.caches.variables_by_name.insert(name.to_string(), v.clone());
        }
        Ok(row)
    }

    // ------------------------------------------------------------------
    // variable -> rules reverse index & invalidation
    // ------------------------------------------------------------------

    async fn rules_by_variable(
        &self,
    ) -> Result<Arc<HashMap<i32, Vec<VariableRule>>>, EngineError> {
        if let Some(map) = self.caches.rules_by_variable.read().await.as_ref() {
            return Ok(map.clone());
        }
        let built = self.build_rules_map().await?;
        let mut slot = self.caches.rules_by_variable.write().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        *slot = Some(built.clone());
        Ok(built)
    }

    /// Build the reverse index from the parsed condition ASTs: a variable
    /// is referenced when its name appears as a string literal in the
    /// condition. Conditions that do not parse fall back to the
    /// quoted-substring match (both quote flavors).
    async fn build_rules_map(
        &self,
    ) -> Result<Arc<HashMap<i32, Vec<VariableRule>>>, EngineError> {
        let variables = self.store.all_variables().await?;
        let goals = self.store.all_goals().await?;
        let mut achievements: HashMap<i32, AchievementRow> = HashMap::new();
        let mut map: HashMap<i32, Vec<VariableRule>> = HashMap::new();

        for goal in &goals {
            let condition = match &goal.condition {
                Some(c) => c,
                None => continue,
            };
            let literals = Expression::parse(condition)
                .ok()
                .map(|e| e.string_literals());

            for variable in &variables {
                let referenced = match &literals {
                    Some(names) => names.iter().any(|n| n == &variable.name),
                    None => {
                        condition.contains(&format!("\"{}\"", variable.name))
                            || condition.contains(&format!("'{}'", variable.name))
                    }
                };
                if !referenced {
                    continue;
                }

                let achievement = match achievements.get(&goal.achievement_id) {
                    Some(a) => a.clone(),
                    None => {
                        let a = self.require_achievement(goal.achievement_id).await?;
                        achievements.insert(goal.achievement_id, a.clone());
                        a
                    }
                };
                map.entry(variable.id).or_default().push(VariableRule {
                    goal: goal.clone(),
                    achievement,
                });
            }
        }

        Ok(Arc::new(map))
    }

    /// Drop everything derived from the rule catalog. Call after any
    /// catalog mutation (new goals, changed conditions, new variables).
    pub async fn invalidate_rule_caches(&self) {
        *self.caches.rules_by_variable.write().await = None;
        *self.caches.languages.write().await = None;
        self.caches.variables_by_name.clear();
        self.caches.translations.clear();
        self.caches.today.clear();
    }

    async fn invalidate_caches_for_variable_and_user(
        &self,
        variable: &VariableRow,
        user_id: i64,
    ) -> Result<(), EngineError> {
        let rules = self.rules_by_variable().await?;
        let entries = match rules.get(&variable.id) {
            Some(entries) => entries,
            None => return Ok(()),
        };

        let goal_ids: Vec<i32> = entries.iter().map(|e| e.goal.id).collect();
        self.clear_goal_caches(user_id, &goal_ids).await?;

        // A value change moves this user on every leaderboard that lists
        // them, so the achievement memo of each reverse-cohort member goes.
        for entry in entries {
            for uid in self
                .relevant_users_reverse(&entry.achievement, user_id)
                .await?
            {
                self.caches
                    .achievement_eval
                    .remove(&(uid, entry.achievement.id));
            }
        }
        Ok(())
    }

    /// Drop the goal memo and the durable mirror for the user and goals.
    pub async fn clear_goal_caches(
        &self,
        user_id: i64,
        goal_ids: &[i32],
    ) -> Result<(), EngineError> {
        for goal_id in goal_ids {
            self.caches.goal_eval.remove(&(*goal_id, user_id));
        }
        self.store.delete_goal_cache(user_id, goal_ids).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // cohorts
    // ------------------------------------------------------------------

    /// Users ranked together with `user_id` for this achievement.
    async fn relevant_users(
        &self,
        achievement: &AchievementRow,
        user_id: i64,
    ) -> Result<Vec<i64>, EngineError> {
        let mut users = vec![user_id];
        match achievement.relevance {
            Relevance::Friends => users.extend(self.store.friends_of(user_id).await?),
            // city cohorts are not partitioned yet; same as own
            Relevance::City | Relevance::Own => {}
        }
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }

    /// Users whose leaderboards contain `user_id` (reverse cohort).
    async fn relevant_users_reverse(
        &self,
        achievement: &AchievementRow,
        user_id: i64,
    ) -> Result<Vec<i64>, EngineError> {
        let mut users = vec![user_id];
        match achievement.relevance {
            Relevance::Friends => users.extend(self.store.friended_by(user_id).await?),
            Relevance::City | Relevance::Own => {}
        }
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }

    // ------------------------------------------------------------------
    // levels
    // ------------------------------------------------------------------

    async fn levels_for(
        &self,
        user_id: i64,
        achievement_id: i32,
    ) -> Result<Arc<Vec<AchievementLevelRow>>, EngineError> {
        if let Some(hit) = self.caches.levels.get(&(user_id, achievement_id)) {
            return Ok(hit.clone());
        }
        let rows = Arc::new(self.store.levels_for(user_id, achievement_id).await?);
        self.caches.levels.insert((user_id, achievement_id), rows.clone());
        Ok(rows)
    }

    /// Current level of the user for this achievement, 0 when unawarded.
    pub async fn get_level(
        &self,
        user_id: i64,
        achievement_id: i32,
    ) -> Result<i32, EngineError> {
        Ok(self
            .levels_for(user_id, achievement_id)
            .await?
            .first()
            .map(|r| r.level)
            .unwrap_or(0))
    }

    async fn target_level(
        &self,
        user_id: i64,
        achievement: &AchievementRow,
    ) -> Result<i32, EngineError> {
        Ok((self.get_level(user_id, achievement.id).await? + 1).min(achievement.maxlevel))
    }

    // ------------------------------------------------------------------
    // translations
    // ------------------------------------------------------------------

    /// Render a translation variable for every defined language, or `None`
    /// when there is no translation reference.
    pub async fn trs(
        &self,
        translation_id: Option<i32>,
        params: &Params,
    ) -> Result<Option<TranslatedText>, EngineError> {
        let id = match translation_id {
            Some(id) => id,
            None => return Ok(None),
        };
        let rows = self.translation_rows(id).await?;
        let languages = self.languages().await?;
        Ok(Some(translation::render_translation_map(
            id,
            &rows,
            &languages,
            &self.settings.fallback_language,
            params,
        )))
    }

    async fn translation_rows(
        &self,
        translation_id: i32,
    ) -> Result<Arc<Vec<(String, String)>>, EngineError> {
        if let Some(hit) = self.caches.translations.get(&translation_id) {
            return Ok(hit.clone());
        }
        let rows = Arc::new(self.store.translations_for(translation_id).await?);
        self.caches.translations.insert(translation_id, rows.clone());
        Ok(rows)
    }

    async fn languages(&self) -> Result<Arc<Vec<String>>, EngineError> {
        if let Some(langs) = self.caches.languages.read().await.as_ref() {
            return Ok(langs.clone());
        }
        let langs = Arc::new(self.store.languages().await?);
        let mut slot = self.caches.languages.write().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        *slot = Some(langs.clone());
        Ok(langs)
    }

    // ------------------------------------------------------------------
    // goal evaluation
    // ------------------------------------------------------------------

    fn decide_achieved(goal: &GoalRow, threshold: Option<f64>, progress: f64) -> (bool, f64) {
        match (goal.operator, threshold) {
            (Some(GoalOperator::Geq), Some(t)) if progress >= t => (true, progress.min(t)),
            (Some(GoalOperator::Leq), Some(t)) if progress <= t => (true, progress.max(t)),
            _ => (false, progress),
        }
    }

    /// Evaluate a goal for a user at a level, updating memo and durable
    /// mirror when the result changed.
    pub async fn evaluate_goal(
        &self,
        goal: &GoalRow,
        user_id: i64,
        level: i32,
    ) -> Result<GoalEvaluation, EngineError> {
        let user = self.require_user(user_id).await?;
        let tz = time_buckets::parse_timezone(&user.timezone);
        let rows = self.store.values_for_user(user_id).await?;

        // Expression failures degrade this goal to (false, 0) instead of
        // taking down the whole achievement evaluation.
        let (achieved, value) =
            match progress::aggregate_progress(goal, &rows, tz, Utc::now()) {
                Ok(progress) => {
                    match expr::evaluate_value_expression(
                        goal.goal.as_deref(),
                        &expr::level_params(level),
                    ) {
                        Ok(threshold) => Self::decide_achieved(goal, threshold, progress),
                        Err(err) => {
                            tracing::warn!(goal_id = goal.id, error = %err, "goal threshold failed");
                            (false, 0.0)
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(goal_id = goal.id, error = %err, "goal condition failed");
                    (false, 0.0)
                }
            };

        if let Some(prior) = self.caches.goal_eval.get(&(goal.id, user_id)) {
            if prior.achieved == achieved && prior.value == value {
                return Ok(prior.clone());
            }
        }

        self.store
            .upsert_goal_cache(&GoalCacheRow {
                goal_id: goal.id,
                user_id,
                value,
                achieved,
            })
            .await?;

        let record = self
            .render_goal_evaluation(goal, user_id, achieved, value)
            .await?;
        self.caches
            .goal_eval
            .insert((goal.id, user_id), record.clone());
        Ok(record)
    }

    async fn render_goal_evaluation(
        &self,
        goal: &GoalRow,
        user_id: i64,
        achieved: bool,
        value: f64,
    ) -> Result<GoalEvaluation, EngineError> {
        let achievement = self.require_achievement(goal.achievement_id).await?;
        let level = self.target_level(user_id, &achievement).await?;
        let basic = self.basic_goal_output(goal, level).await?;
        Ok(GoalEvaluation {
            basic,
            achieved,
            value,
            leaderboard: None,
            leaderboard_position: None,
        })
    }

    /// Rendered per-level view of the goal: threshold, translated name and
    /// properties at a concrete level.
    async fn basic_goal_output(
        &self,
        goal: &GoalRow,
        level: i32,
    ) -> Result<GoalBasicOutput, EngineError> {
        let threshold = match expr::evaluate_value_expression(
            goal.goal.as_deref(),
            &expr::level_params(level),
        ) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(goal_id = goal.id, error = %err, "goal threshold failed");
                None
            }
        };

        let mut params = expr::level_params(level);
        if let Some(t) = threshold {
            params.insert("goal".to_string(), ExprValue::Float(t));
        }
        let goal_name = self.trs(goal.name_translation_id, &params).await?;

        let mut properties = BTreeMap::new();
        for row in self.store.properties_for_goal(goal.id).await? {
            if row.from_level > level {
                continue;
            }
            let value = match &row.value {
                Some(src) => Some(expr::evaluate_string(src, &params)?),
                None => None,
            };
            let value_translated = self.trs(row.value_translation_id, &params).await?;
            properties.insert(
                row.property_id.to_string(),
                PropertyOutput {
                    property_id: row.property_id,
                    name: row.name.clone(),
                    is_variable: row.is_variable,
                    value,
                    value_translated,
                },
            );
        }

        Ok(GoalBasicOutput {
            goal_id: goal.id,
            goal_name,
            goal_goal: threshold,
            priority: goal.priority,
            properties,
        })
    }

    // ------------------------------------------------------------------
    // leaderboard
    // ------------------------------------------------------------------

    /// Ordered ranking of the cohort over the durable goal cache. Members
    /// without a cache row are evaluated at their own target level first.
    pub async fn get_leaderboard(
        &self,
        goal: &GoalRow,
        user_ids: &[i64],
    ) -> Result<Vec<LeaderboardEntry>, EngineError> {
        let mut rows = self.store.goal_cache_for_users(goal.id, user_ids).await?;

        let have: HashSet<i64> = rows.iter().map(|r| r.user_id).collect();
        let missing: Vec<i64> = user_ids
            .iter()
            .copied()
            .filter(|u| !have.contains(u))
            .collect();

        if !missing.is_empty() {
            let achievement = self.require_achievement(goal.achievement_id).await?;
            for uid in missing {
                let target = self.target_level(uid, &achievement).await?;
                self.evaluate_goal(goal, uid, target).await?;
            }
            rows = self.store.goal_cache_for_users(goal.id, user_ids).await?;
        }

        rows.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.user_id.cmp(&a.user_id))
        });

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(position, row)| LeaderboardEntry {
                user_id: row.user_id,
                value: row.value,
                position,
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // achievement evaluation
    // ------------------------------------------------------------------

    /// Evaluate the achievement including all its goals for the user.
    ///
    /// Memoized per `(user, achievement)`: a second call with no
    /// intervening value change returns the identical state.
    pub async fn evaluate_achievement(
        &self,
        user_id: i64,
        achievement_id: i32,
    ) -> Result<AchievementState, EngineError> {
        if let Some(hit) = self.caches.achievement_eval.get(&(user_id, achievement_id)) {
            return Ok(hit.clone());
        }
        let state = self
            .generate_achievement_state(user_id, achievement_id)
            .await?;
        self.caches
            .achievement_eval
            .insert((user_id, achievement_id), state.clone());
        Ok(state)
    }

    async fn generate_achievement_state(
        &self,
        user_id: i64,
        achievement_id: i32,
    ) -> Result<AchievementState, EngineError> {
        let user = self.require_user(user_id).await?;
        let achievement = self.require_achievement(achievement_id).await?;
        let goals = self.store.goals_for_achievement(achievement_id).await?;
        let cohort = self.relevant_users(&achievement, user_id).await?;

        let mut new_levels: BTreeMap<String, NewLevelOutput> = BTreeMap::new();

        // Level transitions are strictly ascending and the loop is bounded
        // by maxlevel, so this terminates.
        loop {
            let level = self.get_level(user_id, achievement_id).await?;
            let target = (level + 1).min(achievement.maxlevel);

            let mut goal_evals: BTreeMap<String, GoalEvaluation> = BTreeMap::new();
            let mut all_achieved = true;

            for goal in &goals {
                // drop the map guard before any await
                let cached = self
                    .caches
                    .goal_eval
                    .get(&(goal.id, user_id))
                    .map(|hit| hit.clone());
                let mut eval = match cached {
                    Some(hit) => hit,
                    None => self.evaluate_goal(goal, user_id, target).await?,
                };

                if achievement.relevance != Relevance::Own {
                    let leaderboard = self.get_leaderboard(goal, &cohort).await?;
                    eval.leaderboard_position =
                        leaderboard.iter().position(|e| e.user_id == user_id);
                    eval.leaderboard = Some(leaderboard);
                }

                if !eval.achieved {
                    all_achieved = false;
                }
                goal_evals.insert(goal.id.to_string(), eval);
            }

            if all_achieved && level < achievement.maxlevel {
                if let Some(awarded) = self
                    .award_level(&user, &achievement, &goals, target)
                    .await?
                {
                    new_levels.insert(target.to_string(), awarded);
                }
                continue;
            }

            // Terminal step: render the full state at the current level.
            let max_level_included = (level + 1).min(achievement.maxlevel);
            let mut levels: BTreeMap<String, LevelOutput> = BTreeMap::new();
            for i in 1..=max_level_included {
                levels.insert(i.to_string(), self.level_output(&achievement, &goals, i).await?);
            }

            let levels_achieved: BTreeMap<String, DateTime<Utc>> = self
                .levels_for(user_id, achievement_id)
                .await?
                .iter()
                .map(|r| (r.level.to_string(), r.awarded_at))
                .collect();

            let achievementcategory = match achievement.category_id {
                Some(id) => self
                    .store
                    .get_category(id)
                    .await?
                    .map(|c| c.name)
                    .unwrap_or_default(),
                None => String::new(),
            };

            return Ok(AchievementState {
                id: achievement.id,
                internal_name: achievement.name.clone(),
                view_permission: achievement.view_permission,
                maxlevel: achievement.maxlevel,
                priority: achievement.priority,
                hidden: achievement.hidden,
                achievementcategory,
                level,
                levels_achieved,
                levels,
                goals: goal_evals,
                new_levels,
            });
        }
    }

    /// Award one level: insert the level row first (the duplicate-key path
    /// means another worker won the race), then materialize rewards and
    /// properties and clear the goal caches for re-evaluation at the next
    /// target.
    async fn award_level(
        &self,
        user: &UserRow,
        achievement: &AchievementRow,
        goals: &[GoalRow],
        target: i32,
    ) -> Result<Option<NewLevelOutput>, EngineError> {
        let inserted = match self
            .store
            .insert_level(user.id, achievement.id, target)
            .await
        {
            Ok(()) => true,
            Err(StoreError::Conflict) => {
                tracing::debug!(
                    user_id = user.id,
                    achievement_id = achievement.id,
                    level = target,
                    "level already awarded elsewhere, re-reading state"
                );
                false
            }
            Err(e) => return Err(e.into()),
        };

        self.caches.levels.remove(&(user.id, achievement.id));
        let goal_ids: Vec<i32> = goals.iter().map(|g| g.id).collect();
        self.clear_goal_caches(user.id, &goal_ids).await?;

        if !inserted {
            return Ok(None);
        }

        let params = expr::level_params(target);

        let mut rewards: BTreeMap<String, RewardOutput> = BTreeMap::new();
        for row in self.new_rewards_for_level(achievement.id, target).await? {
            rewards.insert(row.id.to_string(), self.render_reward(&row, &params).await?);
        }

        let mut properties: BTreeMap<String, PropertyOutput> = BTreeMap::new();
        for row in self.properties_for_level(achievement.id, target).await? {
            let rendered = self.render_achievement_property(&row, &params).await?;

            // Variable-backed properties feed back into the values store,
            // keyed by the achievement so sources stay distinguishable.
            if row.is_variable {
                if let Some(text) = &rendered.value {
                    match text.parse::<f64>() {
                        Ok(amount) => {
                            self.increase_value_for_user(
                                &row.name,
                                user,
                                amount as i64,
                                &achievement.id.to_string(),
                            )
                            .await?;
                        }
                        Err(_) => {
                            tracing::warn!(
                                property = %row.name,
                                value = %text,
                                "variable property value is not numeric"
                            );
                        }
                    }
                }
            }

            properties.insert(row.property_id.to_string(), rendered);
        }

        tracing::info!(
            user_id = user.id,
            achievement_id = achievement.id,
            level = target,
            "level awarded"
        );

        Ok(Some(NewLevelOutput {
            level: target,
            rewards,
            properties,
        }))
    }

    async fn level_output(
        &self,
        achievement: &AchievementRow,
        goals: &[GoalRow],
        level: i32,
    ) -> Result<LevelOutput, EngineError> {
        let params = expr::level_params(level);

        let mut goal_outputs = BTreeMap::new();
        for goal in goals {
            goal_outputs.insert(
                goal.id.to_string(),
                self.basic_goal_output(goal, level).await?,
            );
        }

        let mut rewards = BTreeMap::new();
        for row in self.new_rewards_for_level(achievement.id, level).await? {
            rewards.insert(row.id.to_string(), self.render_reward(&row, &params).await?);
        }

        let mut properties = BTreeMap::new();
        for row in self.properties_for_level(achievement.id, level).await? {
            properties.insert(
                row.property_id.to_string(),
                self.render_achievement_property(&row, &params).await?,
            );
        }

        Ok(LevelOutput {
            level,
            goals: goal_outputs,
            rewards,
            properties,
        })
    }

    /// Rewards newly granted at `level`: rows visible at `level` whose
    /// rendered value differs from their rendering at `level - 1`.
    async fn new_rewards_for_level(
        &self,
        achievement_id: i32,
        level: i32,
    ) -> Result<Vec<AchievementRewardRow>, EngineError> {
        let rows = self.store.rewards_for_achievement(achievement_id).await?;

        let mut prev_keys = HashSet::new();
        for row in rows.iter().filter(|r| r.from_level <= level - 1) {
            prev_keys.insert(self.reward_diff_key(row, level - 1).await?);
        }

        let mut out = Vec::new();
        for row in rows.iter().filter(|r| r.from_level <= level) {
            if !prev_keys.contains(&self.reward_diff_key(row, level).await?) {
                out.push(row.clone());
            }
        }
        Ok(out)
    }

    async fn reward_diff_key(
        &self,
        row: &AchievementRewardRow,
        level: i32,
    ) -> Result<String, EngineError> {
        let params = expr::level_params(level);
        let value = match &row.value {
            Some(src) => expr::evaluate_string(src, &params)?,
            None => String::new(),
        };
        let translated = self.trs(row.value_translation_id, &params).await?;
        Ok(format!("{}|{}|{:?}", row.id, value, translated))
    }

    async fn properties_for_level(
        &self,
        achievement_id: i32,
        level: i32,
    ) -> Result<Vec<AchievementPropertyRow>, EngineError> {
        Ok(self
            .store
            .properties_for_achievement(achievement_id)
            .await?
            .into_iter()
            .filter(|row| row.from_level <= level)
            .collect())
    }

    async fn render_reward(
        &self,
        row: &AchievementRewardRow,
        params: &Params,
    ) -> Result<RewardOutput, EngineError> {
        let value = match &row.value {
            Some(src) => Some(expr::evaluate_string(src, params)?),
            None => None,
        };
        let value_translated = self.trs(row.value_translation_id, params).await?;
        Ok(RewardOutput {
            id: row.id,
            reward_id: row.reward_id,
            name: row.name.clone(),
            value,
            value_translated,
        })
    }

    async fn render_achievement_property(
        &self,
        row: &AchievementPropertyRow,
        params: &Params,
    ) -> Result<PropertyOutput, EngineError> {
        let value = match &row.value {
            Some(src) => Some(expr::evaluate_string(src, params)?),
            None => None,
        };
        let value_translated = self.trs(row.value_translation_id, params).await?;
        Ok(PropertyOutput {
            property_id: row.property_id,
            name: row.name.clone(),
            is_variable: row.is_variable,
            value,
            value_translated,
        })
    }

    // ------------------------------------------------------------------
    // today view
    // ------------------------------------------------------------------

    /// Achievements visible for the user today: valid on the user's local
    /// date and within geographic range. Cached until the user's midnight.
    pub async fn get_achievements_for_user_today(
        &self,
        user_id: i64,
    ) -> Result<Vec<AchievementToday>, EngineError> {
        let user = self.require_user(user_id).await?;
        let now = Utc::now();

        if let Some(hit) = self.caches.today.get(&user_id) {
            let (expires_at, list) = hit.value().clone();
            if now < expires_at {
                return Ok((*list).clone());
            }
        }

        let tz = time_buckets::parse_timezone(&user.timezone);
        let today = now.with_timezone(&tz).date_naive();

        let mut out = Vec::new();
        for achievement in self.store.achievements_valid_on(today).await? {
            if self
                .store
                .goals_for_achievement(achievement.id)
                .await?
                .is_empty()
            {
                continue;
            }

            let distance = match (achievement.lat, achievement.lng) {
                (Some(alat), Some(alng)) => {
                    let max_distance = match achievement.max_distance {
                        Some(d) => d as f64,
                        None => continue,
                    };
                    match (user.lat, user.lng) {
                        (Some(ulat), Some(ulng)) => {
                            let d = haversine_distance(ulat, ulng, alat, alng);
                            if d >= max_distance {
                                continue;
                            }
                            Some(d)
                        }
                        // a user without a location only sees
                        // location-less achievements
                        _ => continue,
                    }
                }
                _ => None,
            };

            out.push(AchievementToday {
                achievement,
                distance,
            });
        }

        let expires_at = time_buckets::end_of_day(tz, now);
        self.caches
            .today
            .insert(user_id, (expires_at, Arc::new(out.clone())));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // user lifecycle
    // ------------------------------------------------------------------

    /// Set the user's metadata and reconcile friends and groups by diff.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_user_infos(
        &self,
        user_id: i64,
        lat: Option<f64>,
        lng: Option<f64>,
        timezone: &str,
        country: Option<String>,
        region: Option<String>,
        city: Option<String>,
        friends: &[i64],
        groups: &[i64],
    ) -> Result<(), EngineError> {
        let now = Utc::now();

        let new_friends: HashSet<i64> = friends.iter().copied().collect();
        let mut lookup: Vec<i64> = vec![user_id];
        lookup.extend(friends);
        let existing_users = self.store.existing_user_ids(&lookup).await?;
        let existing_friends: HashSet<i64> =
            self.store.friends_of(user_id).await?.into_iter().collect();

        let mut friends_to_create: Vec<i64> = new_friends
            .iter()
            .copied()
            .filter(|f| !existing_users.contains(f) && *f != user_id)
            .collect();
        let mut friends_to_append: Vec<i64> = new_friends
            .difference(&existing_friends)
            .copied()
            .collect();
        let mut friends_to_delete: Vec<i64> = existing_friends
            .difference(&new_friends)
            .copied()
            .collect();
        friends_to_create.sort_unstable();
        friends_to_append.sort_unstable();
        friends_to_delete.sort_unstable();

        let new_groups: HashSet<i64> = groups.iter().copied().collect();
        let existing_groups = self.store.existing_group_ids(groups).await?;
        let existing_groups_of_user: HashSet<i64> =
            self.store.groups_of_user(user_id).await?.into_iter().collect();

        let mut groups_to_create: Vec<i64> = new_groups
            .iter()
            .copied()
            .filter(|g| !existing_groups.contains(g))
            .collect();
        let mut groups_to_append: Vec<i64> = new_groups
            .difference(&existing_groups_of_user)
            .copied()
            .collect();
        let mut groups_to_delete: Vec<i64> = existing_groups_of_user
            .difference(&new_groups)
            .copied()
            .collect();
        groups_to_create.sort_unstable();
        groups_to_append.sort_unstable();
        groups_to_delete.sort_unstable();

        let created_at = self
            .store
            .get_user(user_id)
            .await?
            .map(|u| u.created_at)
            .unwrap_or(now);
        self.store
            .upsert_user(&UserRow {
                id: user_id,
                lat,
                lng,
                timezone: timezone.to_string(),
                country,
                region,
                city,
                created_at,
            })
            .await?;

        if !friends_to_create.is_empty() {
            let bare: Vec<UserRow> = friends_to_create
                .iter()
                .map(|id| UserRow::bare(*id, now))
                .collect();
            self.store.create_users(&bare).await?;
        }
        if !friends_to_delete.is_empty() {
            self.store.remove_friends(user_id, &friends_to_delete).await?;
        }
        if !friends_to_append.is_empty() {
            self.store.add_friends(user_id, &friends_to_append).await?;
        }

        if !groups_to_create.is_empty() {
            self.store.create_groups(&groups_to_create).await?;
        }
        if !groups_to_delete.is_empty() {
            self.store
                .remove_group_memberships(user_id, &groups_to_delete)
                .await?;
        }
        if !groups_to_append.is_empty() {
            self.store
                .add_group_memberships(user_id, &groups_to_append)
                .await?;
        }

        Ok(())
    }

    /// Delete a user including all dependencies, and drop their memos.
    pub async fn delete_user(&self, user_id: i64) -> Result<(), EngineError> {
        self.store.delete_user(user_id).await?;

        self.caches.goal_eval.retain(|(_, uid), _| *uid != user_id);
        self.caches
            .achievement_eval
            .retain(|(uid, _), _| *uid != user_id);
        self.caches.levels.retain(|(uid, _), _| *uid != user_id);
        self.caches.today.remove(&user_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // catalog bookkeeping
    // ------------------------------------------------------------------

    /// Create or update an achievement property definition. A property
    /// marked `is_variable` auto-materializes a day-grouped variable of the
    /// same name, closing the loop between rewards and the values store.
    pub async fn create_achievement_property(
        &self,
        name: &str,
        is_variable: bool,
    ) -> Result<AchievementPropertyDef, EngineError> {
        let def = self
            .store
            .upsert_achievement_property(name, is_variable)
            .await?;

        if is_variable && self.variable_by_name(name).await?.is_none() {
            match self
                .store
                .create_variable(name, VariableGroup::Day, IncreasePermission::Admin)
                .await
            {
                Ok(variable) => {
                    tracing::info!(variable = %name, "variable auto-created for property");
                    self.caches
                        .variables_by_name
                        .insert(name.to_string(), variable);
                }
                // raced with another writer; the variable exists now
                Err(StoreError::Conflict) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.invalidate_rule_caches().await;
        Ok(def)
    }
}

// ============================================================================
// GEO
// ============================================================================

/// Great-circle distance between two coordinates, in meters.
fn haversine_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

// ============================================================================
// TESTS
// ============================================================================
// Core logic is tested against the in-memory store; the same scenarios run
// unchanged against the SQLite adapter.

#[cfg(test)]
mod tests {
    use super::models::{
        AchievementPropertyRow, AchievementRewardRow, Evaluation, MaxMin, ViewPermission,
    };
    use super::*;
    use crate::infra::store::InMemoryGameStore;

    fn achievement(id: i32, maxlevel: i32, relevance: Relevance) -> AchievementRow {
        AchievementRow {
            id,
            name: format!("achievement_{}", id),
            category_id: None,
            maxlevel,
            hidden: false,
            valid_start: None,
            valid_end: None,
            lat: None,
            lng: None,
            max_distance: None,
            priority: 0,
            relevance,
            view_permission: ViewPermission::Everyone,
        }
    }

    fn goal(id: i32, achievement_id: i32, condition: &str, goal_expr: &str) -> GoalRow {
        GoalRow {
            id,
            name: format!("goal_{}", id),
            name_translation_id: None,
            condition: Some(condition.to_string()),
            evaluation: Evaluation::Immediately,
            timespan: None,
            group_by_key: false,
            group_by_dateformat: None,
            goal: Some(goal_expr.to_string()),
            operator: Some(GoalOperator::Geq),
            maxmin: MaxMin::Max,
            achievement_id,
            priority: 0,
        }
    }

    async fn add_user(store: &InMemoryGameStore, id: i64) {
        store
            .upsert_user(&UserRow::bare(id, Utc::now()))
            .await
            .unwrap();
    }

    async fn add_variable(store: &InMemoryGameStore, name: &str, group: VariableGroup) {
        store
            .create_variable(name, group, IncreasePermission::Admin)
            .await
            .unwrap();
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[tokio::test]
    async fn test_single_level_geq_progression() {
        init_tracing();
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_category(models::AchievementCategoryRow {
            id: 9,
            name: "daily challenges".to_string(),
        });
        let mut a = achievement(1, 3, Relevance::Own);
        a.category_id = Some(9);
        store.insert_achievement(a);
        store.insert_goal(goal(1, 1, "variable_name == \"points\"", "level*100"));
        let service = GamificationService::new(store);

        service.increase_value("points", 1, 40, "").await.unwrap();
        service.increase_value("points", 1, 70, "").await.unwrap();

        let state = service.evaluate_achievement(1, 1).await.unwrap();
        assert_eq!(state.level, 1);
        assert_eq!(state.maxlevel, 3);
        assert_eq!(state.achievementcategory, "daily challenges");
        assert!(state.new_levels.contains_key("1"));
        assert!(state.levels_achieved.contains_key("1"));
        // the next level is rendered so clients can show its threshold
        assert_eq!(state.levels["2"].goals["1"].goal_goal, Some(200.0));
        // re-evaluated at the new target: 110 points toward 200
        let eval = &state.goals["1"];
        assert!(!eval.achieved);
        assert_eq!(eval.value, 110.0);
    }

    #[tokio::test]
    async fn test_evaluation_is_idempotent_between_value_changes() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 3, Relevance::Own));
        store.insert_goal(goal(1, 1, "variable_name == \"points\"", "level*100"));
        let service = GamificationService::new(store);

        service.increase_value("points", 1, 120, "").await.unwrap();

        let first = service.evaluate_achievement(1, 1).await.unwrap();
        let second = service.evaluate_achievement(1, 1).await.unwrap();
        assert_eq!(first, second);
        // idempotent also for the awarded trail: level 1 exists exactly once
        let rows = service.store().levels_for(1, 1).await.unwrap();
        assert_eq!(rows.iter().filter(|r| r.level == 1).count(), 1);
    }

    #[tokio::test]
    async fn test_leq_min_grouping_awards_two_levels_in_one_call() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "latency_ms", VariableGroup::None).await;
        store.insert_achievement(achievement(1, 2, Relevance::Own));
        let mut g = goal(1, 1, "variable_name == \"latency_ms\"", "level*50");
        g.operator = Some(GoalOperator::Leq);
        g.maxmin = MaxMin::Min;
        g.group_by_dateformat = Some("YYYY-MM-DD".to_string());
        store.insert_goal(g);
        let service = GamificationService::new(store);

        // daily sum 40: satisfies <= 50 (level 1) and <= 100 (level 2)
        service.increase_value("latency_ms", 1, 40, "").await.unwrap();

        let state = service.evaluate_achievement(1, 1).await.unwrap();
        assert_eq!(state.level, 2);
        assert!(state.new_levels.contains_key("1"));
        assert!(state.new_levels.contains_key("2"));
        // level rows are contiguous 1..=2
        let levels: Vec<i32> = service
            .store()
            .levels_for(1, 1)
            .await
            .unwrap()
            .iter()
            .map(|r| r.level)
            .collect();
        assert_eq!(levels, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_friend_leaderboard_with_clamped_achiever() {
        let store = InMemoryGameStore::new();
        for id in [1, 2, 3] {
            add_user(&store, id).await;
        }
        store.add_friends(1, &[2, 3]).await.unwrap();
        add_variable(&store, "score", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 1, Relevance::Friends));
        store.insert_goal(goal(1, 1, "variable_name == \"score\"", "1000"));
        let service = GamificationService::new(store);

        service.increase_value("score", 1, 800, "").await.unwrap();
        service.increase_value("score", 2, 1200, "").await.unwrap();
        service.increase_value("score", 3, 500, "").await.unwrap();

        let state = service.evaluate_achievement(1, 1).await.unwrap();
        let eval = &state.goals["1"];
        let leaderboard = eval.leaderboard.as_ref().unwrap();

        // U2 achieved and is clamped to the threshold
        assert_eq!(leaderboard.len(), 3);
        assert_eq!(
            (leaderboard[0].user_id, leaderboard[0].value, leaderboard[0].position),
            (2, 1000.0, 0)
        );
        assert_eq!(
            (leaderboard[1].user_id, leaderboard[1].value, leaderboard[1].position),
            (1, 800.0, 1)
        );
        assert_eq!(
            (leaderboard[2].user_id, leaderboard[2].value, leaderboard[2].position),
            (3, 500.0, 2)
        );
        assert_eq!(eval.leaderboard_position, Some(1));
    }

    #[tokio::test]
    async fn test_invalidation_fans_out_to_reverse_cohort() {
        let store = InMemoryGameStore::new();
        for id in [1, 2, 3] {
            add_user(&store, id).await;
        }
        store.add_friends(1, &[2, 3]).await.unwrap();
        store.add_friends(2, &[1]).await.unwrap(); // U2 lists U1
        add_variable(&store, "score", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 1, Relevance::Friends));
        store.insert_goal(goal(1, 1, "variable_name == \"score\"", "1000"));
        let service = GamificationService::new(store);

        service.increase_value("score", 1, 800, "").await.unwrap();
        service.increase_value("score", 2, 300, "").await.unwrap();

        let before = service.evaluate_achievement(2, 1).await.unwrap();
        let lb_before = before.goals["1"].leaderboard.as_ref().unwrap();
        assert_eq!(lb_before[0].user_id, 1);
        assert_eq!(lb_before[0].value, 800.0);

        // U1 gains 500; U2's memoized evaluation must not stay stale
        service.increase_value("score", 1, 500, "").await.unwrap();

        let after = service.evaluate_achievement(2, 1).await.unwrap();
        let lb_after = after.goals["1"].leaderboard.as_ref().unwrap();
        // U1 now achieved, clamped to 1000
        assert_eq!(lb_after[0].user_id, 1);
        assert_eq!(lb_after[0].value, 1000.0);
    }

    #[tokio::test]
    async fn test_property_variable_feeds_back_into_values() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 2, Relevance::Own));
        store.insert_goal(goal(1, 1, "variable_name == \"points\"", "level*100"));
        store.insert_achievement_property_row(
            1,
            AchievementPropertyRow {
                property_id: 10,
                name: "xp".to_string(),
                is_variable: true,
                from_level: 1,
                value: Some("10*level".to_string()),
                value_translation_id: None,
            },
        );
        let service = GamificationService::new(store);

        // the xp variable is auto-materialized with day grouping
        service.create_achievement_property("xp", true).await.unwrap();
        let variable = service
            .store()
            .variable_by_name("xp")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(variable.group, VariableGroup::Day);

        service.increase_value("points", 1, 100, "").await.unwrap();
        let state = service.evaluate_achievement(1, 1).await.unwrap();
        assert_eq!(state.level, 1);

        // the level-1 xp property fed back, keyed by the achievement id
        assert_eq!(service.store().stored_total(1, "xp", "1"), 10);
        let new_level = &state.new_levels["1"];
        assert_eq!(new_level.properties["10"].value.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_translation_fallback_through_service() {
        let store = InMemoryGameStore::new();
        store.insert_language("en");
        store.insert_language("de");
        store.insert_translation(5, "de", "'Hallo'");
        let service = GamificationService::new(store);

        let map = service.trs(Some(5), &Params::new()).await.unwrap().unwrap();
        assert_eq!(map["de"], "Hallo");
        assert_eq!(map["en"], "[not_translated]_5");

        assert!(service.trs(None, &Params::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ungrouped_values_sum_across_rows() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "clicks", VariableGroup::None).await;
        let service = GamificationService::new(store);

        for amount in [1, 2, 3, 4] {
            service.increase_value("clicks", 1, amount, "").await.unwrap();
        }
        assert_eq!(service.store().stored_total(1, "clicks", ""), 10);
    }

    #[tokio::test]
    async fn test_day_grouped_values_collapse_to_one_row() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "steps", VariableGroup::Day).await;
        let service = GamificationService::new(store);

        service.increase_value("steps", 1, 100, "").await.unwrap();
        service.increase_value("steps", 1, 250, "").await.unwrap();

        assert_eq!(service.store().stored_row_count(1, "steps", ""), 1);
        assert_eq!(service.store().stored_total(1, "steps", ""), 350);
    }

    #[tokio::test]
    async fn test_unknown_variable_is_surfaced() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        let service = GamificationService::new(store);

        let err = service.increase_value("nope", 1, 1, "").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownVariable(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_goal_cache_clamps_per_operator() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 1, Relevance::Own));
        let g = goal(1, 1, "variable_name == \"points\"", "100");
        store.insert_goal(g.clone());
        let service = GamificationService::new(store);

        service.increase_value("points", 1, 150, "").await.unwrap();
        let eval = service.evaluate_goal(&g, 1, 1).await.unwrap();
        assert!(eval.achieved);
        assert_eq!(eval.value, 100.0);

        // the durable mirror carries the clamped value too
        let row = service.store().get_goal_cache(1, 1).await.unwrap().unwrap();
        assert!(row.achieved);
        assert_eq!(row.value, 100.0);
    }

    #[tokio::test]
    async fn test_goal_without_threshold_is_never_achieved() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 1, Relevance::Own));
        let mut g = goal(1, 1, "variable_name == \"points\"", "");
        g.goal = None;
        store.insert_goal(g.clone());
        let service = GamificationService::new(store);

        service.increase_value("points", 1, 500, "").await.unwrap();
        let eval = service.evaluate_goal(&g, 1, 1).await.unwrap();
        assert!(!eval.achieved);
        assert_eq!(eval.value, 500.0);
    }

    #[tokio::test]
    async fn test_broken_condition_degrades_to_unachieved() {
        init_tracing();
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 1, Relevance::Own));
        let g = goal(1, 1, "variable_name ==", "100");
        store.insert_goal(g.clone());
        let service = GamificationService::new(store);

        service.increase_value("points", 1, 500, "").await.unwrap();
        let eval = service.evaluate_goal(&g, 1, 1).await.unwrap();
        assert!(!eval.achieved);
        assert_eq!(eval.value, 0.0);
    }

    #[tokio::test]
    async fn test_goal_name_and_properties_render_per_level() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_language("en");
        // the goal name interpolates the current threshold
        store.insert_translation(3, "en", "'Collect ' + goal + ' points'");
        store.insert_achievement(achievement(1, 1, Relevance::Own));
        let mut g = goal(1, 1, "variable_name == \"points\"", "level*100");
        g.name_translation_id = Some(3);
        store.insert_goal(g.clone());
        store.insert_goal_property_row(
            1,
            models::GoalPropertyRow {
                property_id: 4,
                name: "unit".to_string(),
                is_variable: false,
                from_level: 1,
                value: Some("'points'".to_string()),
                value_translation_id: None,
            },
        );
        let service = GamificationService::new(store);

        service.increase_value("points", 1, 10, "").await.unwrap();
        let eval = service.evaluate_goal(&g, 1, 1).await.unwrap();
        assert_eq!(
            eval.basic.goal_name.as_ref().unwrap()["en"],
            "Collect 100 points"
        );
        assert_eq!(eval.basic.properties["4"].value.as_deref(), Some("points"));
    }

    #[tokio::test]
    async fn test_new_rewards_are_diffed_between_levels() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 2, Relevance::Own));
        store.insert_goal(goal(1, 1, "variable_name == \"points\"", "level*100"));
        // a static badge: granted once at level 1, unchanged at level 2
        store.insert_reward_row(
            1,
            AchievementRewardRow {
                id: 1,
                reward_id: 1,
                name: "badge".to_string(),
                from_level: 1,
                value: Some("'gold'".to_string()),
                value_translation_id: None,
            },
        );
        // a level-scaled bonus: its rendered value changes every level
        store.insert_reward_row(
            1,
            AchievementRewardRow {
                id: 2,
                reward_id: 2,
                name: "bonus".to_string(),
                from_level: 1,
                value: Some("5*level".to_string()),
                value_translation_id: None,
            },
        );
        let service = GamificationService::new(store);

        service.increase_value("points", 1, 250, "").await.unwrap();
        let state = service.evaluate_achievement(1, 1).await.unwrap();
        assert_eq!(state.level, 2);

        let level1 = &state.new_levels["1"];
        assert!(level1.rewards.contains_key("1"));
        assert!(level1.rewards.contains_key("2"));
        assert_eq!(level1.rewards["2"].value.as_deref(), Some("5"));

        // at level 2 only the scaled reward is new
        let level2 = &state.new_levels["2"];
        assert!(!level2.rewards.contains_key("1"));
        assert_eq!(level2.rewards["2"].value.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_today_view_filters_by_date_and_distance() {
        let store = InMemoryGameStore::new();
        let mut user = UserRow::bare(1, Utc::now());
        user.lat = Some(48.137);
        user.lng = Some(11.575); // Munich
        store.upsert_user(&user).await.unwrap();
        add_variable(&store, "points", VariableGroup::Day).await;

        // no location: always visible
        store.insert_achievement(achievement(1, 1, Relevance::Own));
        store.insert_goal(goal(1, 1, "variable_name == \"points\"", "100"));

        // nearby (about 1km away), generous radius
        let mut near = achievement(2, 1, Relevance::Own);
        near.lat = Some(48.14);
        near.lng = Some(11.58);
        near.max_distance = Some(10_000);
        store.insert_achievement(near);
        store.insert_goal(goal(2, 2, "variable_name == \"points\"", "100"));

        // far away (Berlin), small radius
        let mut far = achievement(3, 1, Relevance::Own);
        far.lat = Some(52.52);
        far.lng = Some(13.405);
        far.max_distance = Some(10_000);
        store.insert_achievement(far);
        store.insert_goal(goal(3, 3, "variable_name == \"points\"", "100"));

        // expired validity window
        let mut expired = achievement(4, 1, Relevance::Own);
        expired.valid_end = chrono::NaiveDate::from_ymd_opt(2000, 1, 1);
        store.insert_achievement(expired);
        store.insert_goal(goal(4, 4, "variable_name == \"points\"", "100"));

        // no goals: never listed
        store.insert_achievement(achievement(5, 1, Relevance::Own));

        let service = GamificationService::new(store);
        let today = service.get_achievements_for_user_today(1).await.unwrap();
        let ids: Vec<i32> = today.iter().map(|t| t.achievement.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(today[0].distance.is_none());
        assert!(today[1].distance.unwrap() < 10_000.0);
    }

    #[tokio::test]
    async fn test_set_user_infos_reconciles_friends_and_groups() {
        let store = InMemoryGameStore::new();
        let service = GamificationService::new(store);

        service
            .set_user_infos(1, None, None, "Europe/Berlin", None, None, None, &[2, 3], &[10])
            .await
            .unwrap();
        assert_eq!(service.store().friends_of(1).await.unwrap(), vec![2, 3]);
        assert_eq!(service.store().groups_of_user(1).await.unwrap(), vec![10]);
        // referenced friends were created as bare users
        assert!(service.store().get_user(2).await.unwrap().is_some());

        // shrink and grow the sets: diffs are applied, not rewrites
        service
            .set_user_infos(1, None, None, "Europe/Berlin", None, None, None, &[3, 4], &[11])
            .await
            .unwrap();
        assert_eq!(service.store().friends_of(1).await.unwrap(), vec![3, 4]);
        assert_eq!(service.store().groups_of_user(1).await.unwrap(), vec![11]);

        let user = service.store().get_user(1).await.unwrap().unwrap();
        assert_eq!(user.timezone, "Europe/Berlin");
    }

    #[tokio::test]
    async fn test_delete_user_cascades_and_forgets() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        add_variable(&store, "points", VariableGroup::Day).await;
        store.insert_achievement(achievement(1, 1, Relevance::Own));
        store.insert_goal(goal(1, 1, "variable_name == \"points\"", "100"));
        let service = GamificationService::new(store);

        service.increase_value("points", 1, 150, "").await.unwrap();
        service.evaluate_achievement(1, 1).await.unwrap();

        service.delete_user(1).await.unwrap();
        assert!(service.store().get_user(1).await.unwrap().is_none());
        assert!(service.store().values_for_user(1).await.unwrap().is_empty());
        assert!(service.store().levels_for(1, 1).await.unwrap().is_empty());
        assert!(matches!(
            service.evaluate_achievement(1, 1).await,
            Err(EngineError::UnknownUser(1))
        ));
    }

    struct TestCtx {
        perms: Vec<&'static str>,
        user_id: Option<i64>,
    }

    impl PermissionContext for TestCtx {
        fn has_perm(&self, permission: &str) -> bool {
            self.perms.contains(&permission)
        }
        fn user_id(&self) -> Option<i64> {
            self.user_id
        }
    }

    #[tokio::test]
    async fn test_may_increase_gate() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        store
            .create_variable("steps", VariableGroup::Day, IncreasePermission::Own)
            .await
            .unwrap();
        store
            .create_variable("admin_only", VariableGroup::Day, IncreasePermission::Admin)
            .await
            .unwrap();
        let service = GamificationService::with_settings(
            store,
            EngineSettings {
                enable_user_authentication: true,
                fallback_language: "en".to_string(),
            },
        );

        let me = TestCtx { perms: vec![], user_id: Some(1) };
        let other = TestCtx { perms: vec![], user_id: Some(2) };
        let admin = TestCtx {
            perms: vec![PERM_GLOBAL_INCREASE_VALUE],
            user_id: None,
        };

        // own-permission variable: only for myself, admins always may
        service
            .increase_value_checked(&me, "steps", 1, 10, "")
            .await
            .unwrap();
        assert!(matches!(
            service.increase_value_checked(&other, "steps", 1, 10, "").await,
            Err(EngineError::PermissionDenied)
        ));
        service
            .increase_value_checked(&admin, "steps", 1, 10, "")
            .await
            .unwrap();

        // admin-permission variable: not even for myself
        assert!(matches!(
            service
                .increase_value_checked(&me, "admin_only", 1, 10, "")
                .await,
            Err(EngineError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_gate_disabled_without_authentication() {
        let store = InMemoryGameStore::new();
        add_user(&store, 1).await;
        store
            .create_variable("steps", VariableGroup::Day, IncreasePermission::Admin)
            .await
            .unwrap();
        let service = GamificationService::new(store); // auth disabled by default

        let nobody = TestCtx { perms: vec![], user_id: None };
        service
            .increase_value_checked(&nobody, "steps", 1, 10, "")
            .await
            .unwrap();
    }
}
