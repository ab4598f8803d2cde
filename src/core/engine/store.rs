// Storage port for the evaluation core.
//
// The core defines WHAT it needs from persistence; adapters in `infra`
// decide HOW (SQLite for production, dashmap for tests). Every method is a
// single transactional primitive: the engine composes them but never asks
// the store to run business logic.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use thiserror::Error;

use crate::core::engine::models::{
    AchievementCategoryRow, AchievementLevelRow, AchievementPropertyDef, AchievementPropertyRow,
    AchievementRewardRow, AchievementRow, GoalCacheRow, GoalPropertyRow, GoalRow, IncreasePermission,
    UserRow, UserValueRow, VariableGroup, VariableRow,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint fired, e.g. a level row that already exists.
    #[error("Conflict: row already exists")]
    Conflict,

    #[error("Storage error: {0}")]
    Database(String),
}

#[async_trait]
pub trait GameStore: Send + Sync {
    // ------------------------------------------------------------------
    // users & social graph
    // ------------------------------------------------------------------

    async fn get_user(&self, user_id: i64) -> Result<Option<UserRow>, StoreError>;

    /// Insert or fully replace a user row.
    async fn upsert_user(&self, user: &UserRow) -> Result<(), StoreError>;

    /// Which of the given ids already exist as users.
    async fn existing_user_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError>;

    /// Create bare user rows (UTC timezone, no location) for the ids.
    async fn create_users(&self, users: &[UserRow]) -> Result<(), StoreError>;

    /// Users this user points at (the user's own friends list).
    async fn friends_of(&self, user_id: i64) -> Result<Vec<i64>, StoreError>;

    /// Users pointing at this user (whose friends lists contain them).
    async fn friended_by(&self, user_id: i64) -> Result<Vec<i64>, StoreError>;

    async fn add_friends(&self, user_id: i64, to_ids: &[i64]) -> Result<(), StoreError>;
    async fn remove_friends(&self, user_id: i64, to_ids: &[i64]) -> Result<(), StoreError>;

    async fn existing_group_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError>;
    async fn create_groups(&self, ids: &[i64]) -> Result<(), StoreError>;
    async fn groups_of_user(&self, user_id: i64) -> Result<Vec<i64>, StoreError>;
    async fn add_group_memberships(&self, user_id: i64, group_ids: &[i64])
        -> Result<(), StoreError>;
    async fn remove_group_memberships(
        &self,
        user_id: i64,
        group_ids: &[i64],
    ) -> Result<(), StoreError>;

    /// Remove the user and everything hanging off them: level rows, goal
    /// cache rows, friend edges in both directions, memberships, values.
    async fn delete_user(&self, user_id: i64) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // variables & values
    // ------------------------------------------------------------------

    async fn variable_by_name(&self, name: &str) -> Result<Option<VariableRow>, StoreError>;

    async fn all_variables(&self) -> Result<Vec<VariableRow>, StoreError>;

    /// Create a variable; `Conflict` when the name is taken.
    async fn create_variable(
        &self,
        name: &str,
        group: VariableGroup,
        increase_permission: IncreasePermission,
    ) -> Result<VariableRow, StoreError>;

    /// Upsert-add: a row with the same `(user, variable, datetime, key)`
    /// identity has `amount` added to its value, otherwise a new row is
    /// inserted. Must be atomic.
    async fn add_value(
        &self,
        user_id: i64,
        variable_id: i32,
        datetime: DateTime<Utc>,
        key: &str,
        amount: i64,
    ) -> Result<(), StoreError>;

    /// All value rows of the user, joined with the variable name.
    async fn values_for_user(&self, user_id: i64) -> Result<Vec<UserValueRow>, StoreError>;

    // ------------------------------------------------------------------
    // catalog
    // ------------------------------------------------------------------

    async fn get_achievement(&self, achievement_id: i32)
        -> Result<Option<AchievementRow>, StoreError>;

    async fn all_achievements(&self) -> Result<Vec<AchievementRow>, StoreError>;

    /// Achievements whose validity window contains `date` (open bounds
    /// count as valid).
    async fn achievements_valid_on(&self, date: NaiveDate)
        -> Result<Vec<AchievementRow>, StoreError>;

    async fn goals_for_achievement(&self, achievement_id: i32)
        -> Result<Vec<GoalRow>, StoreError>;

    async fn all_goals(&self) -> Result<Vec<GoalRow>, StoreError>;

    async fn get_category(
        &self,
        category_id: i32,
    ) -> Result<Option<AchievementCategoryRow>, StoreError>;

    /// All reward rows of the achievement, any `from_level`.
    async fn rewards_for_achievement(
        &self,
        achievement_id: i32,
    ) -> Result<Vec<AchievementRewardRow>, StoreError>;

    /// All property rows of the achievement, any `from_level`.
    async fn properties_for_achievement(
        &self,
        achievement_id: i32,
    ) -> Result<Vec<AchievementPropertyRow>, StoreError>;

    async fn properties_for_goal(&self, goal_id: i32) -> Result<Vec<GoalPropertyRow>, StoreError>;

    /// Insert or update a property definition by name.
    async fn upsert_achievement_property(
        &self,
        name: &str,
        is_variable: bool,
    ) -> Result<AchievementPropertyDef, StoreError>;

    // ------------------------------------------------------------------
    // awarded levels
    // ------------------------------------------------------------------

    /// Level rows for `(user, achievement)`, highest level first.
    async fn levels_for(
        &self,
        user_id: i64,
        achievement_id: i32,
    ) -> Result<Vec<AchievementLevelRow>, StoreError>;

    /// Insert one level row. `Conflict` when `(user, achievement, level)`
    /// already exists; that means another worker awarded it first.
    async fn insert_level(
        &self,
        user_id: i64,
        achievement_id: i32,
        level: i32,
    ) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // durable goal evaluation cache
    // ------------------------------------------------------------------

    async fn get_goal_cache(
        &self,
        goal_id: i32,
        user_id: i64,
    ) -> Result<Option<GoalCacheRow>, StoreError>;

    async fn goal_cache_for_users(
        &self,
        goal_id: i32,
        user_ids: &[i64],
    ) -> Result<Vec<GoalCacheRow>, StoreError>;

    async fn upsert_goal_cache(&self, row: &GoalCacheRow) -> Result<(), StoreError>;

    async fn delete_goal_cache(&self, user_id: i64, goal_ids: &[i32]) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // translations
    // ------------------------------------------------------------------

    /// `(language name, text)` pairs for one translation variable.
    async fn translations_for(
        &self,
        translation_id: i32,
    ) -> Result<Vec<(String, String)>, StoreError>;

    async fn languages(&self) -> Result<Vec<String>, StoreError>;
}
