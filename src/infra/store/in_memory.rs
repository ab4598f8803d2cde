// This file provides an IN-MEMORY implementation of GameStore.
//
// The core tests run against this adapter: same contract as the SQLite
// store, no database setup. DashMap keeps every primitive safe under
// concurrent evaluation tasks.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::core::engine::models::{
    AchievementCategoryRow, AchievementLevelRow, AchievementPropertyDef, AchievementPropertyRow,
    AchievementRewardRow, AchievementRow, GoalCacheRow, GoalPropertyRow, GoalRow,
    IncreasePermission, UserRow, UserValueRow, VariableGroup, VariableRow,
};
use crate::core::engine::store::{GameStore, StoreError};

/// Identity of one value row: increments with the same key collapse.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
struct ValueKey {
    user_id: i64,
    variable_id: i32,
    datetime: DateTime<Utc>,
    key: String,
}

pub struct InMemoryGameStore {
    users: DashMap<i64, UserRow>,
    /// directed friend edges (from, to)
    friend_edges: DashMap<(i64, i64), ()>,
    groups: DashMap<i64, ()>,
    memberships: DashMap<(i64, i64), ()>,

    variables: DashMap<i32, VariableRow>,
    variable_seq: AtomicI32,
    values: DashMap<ValueKey, i64>,

    categories: DashMap<i32, AchievementCategoryRow>,
    achievements: DashMap<i32, AchievementRow>,
    goals: DashMap<i32, GoalRow>,
    rewards: DashMap<i32, Vec<AchievementRewardRow>>,
    achievement_properties: DashMap<i32, Vec<AchievementPropertyRow>>,
    goal_properties: DashMap<i32, Vec<GoalPropertyRow>>,
    property_defs: DashMap<i32, AchievementPropertyDef>,
    property_seq: AtomicI32,

    /// (user, achievement, level) -> awarded_at
    levels: DashMap<(i64, i32, i32), DateTime<Utc>>,
    goal_cache: DashMap<(i32, i64), GoalCacheRow>,

    translations: DashMap<i32, Vec<(String, String)>>,
    languages: Mutex<Vec<String>>,
}

impl InMemoryGameStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            friend_edges: DashMap::new(),
            groups: DashMap::new(),
            memberships: DashMap::new(),
            variables: DashMap::new(),
            variable_seq: AtomicI32::new(1),
            values: DashMap::new(),
            categories: DashMap::new(),
            achievements: DashMap::new(),
            goals: DashMap::new(),
            rewards: DashMap::new(),
            achievement_properties: DashMap::new(),
            goal_properties: DashMap::new(),
            property_defs: DashMap::new(),
            property_seq: AtomicI32::new(1),
            levels: DashMap::new(),
            goal_cache: DashMap::new(),
            translations: DashMap::new(),
            languages: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // catalog loading (used by setup code and tests; not part of the port)
    // ------------------------------------------------------------------

    pub fn insert_category(&self, category: AchievementCategoryRow) {
        self.categories.insert(category.id, category);
    }

    pub fn insert_achievement(&self, achievement: AchievementRow) {
        self.achievements.insert(achievement.id, achievement);
    }

    pub fn insert_goal(&self, goal: GoalRow) {
        self.goals.insert(goal.id, goal);
    }

    pub fn insert_reward_row(&self, achievement_id: i32, row: AchievementRewardRow) {
        self.rewards.entry(achievement_id).or_default().push(row);
    }

    pub fn insert_achievement_property_row(&self, achievement_id: i32, row: AchievementPropertyRow) {
        self.achievement_properties
            .entry(achievement_id)
            .or_default()
            .push(row);
    }

    pub fn insert_goal_property_row(&self, goal_id: i32, row: GoalPropertyRow) {
        self.goal_properties.entry(goal_id).or_default().push(row);
    }

    pub fn insert_language(&self, name: &str) {
        let mut langs = self.languages.lock().unwrap();
        if !langs.iter().any(|l| l == name) {
            langs.push(name.to_string());
        }
    }

    pub fn insert_translation(&self, translation_id: i32, language: &str, text: &str) {
        self.translations
            .entry(translation_id)
            .or_default()
            .push((language.to_string(), text.to_string()));
    }

    /// Total stored value for `(user, variable name, key)` across buckets.
    pub fn stored_total(&self, user_id: i64, variable_name: &str, key: &str) -> i64 {
        let variable_id = self
            .variables
            .iter()
            .find(|v| v.name == variable_name)
            .map(|v| v.id);
        let Some(variable_id) = variable_id else {
            return 0;
        };
        self.values
            .iter()
            .filter(|e| {
                e.key().user_id == user_id
                    && e.key().variable_id == variable_id
                    && e.key().key == key
            })
            .map(|e| *e.value())
            .sum()
    }

    /// Number of distinct value rows for `(user, variable name, key)`.
    pub fn stored_row_count(&self, user_id: i64, variable_name: &str, key: &str) -> usize {
        let variable_id = self
            .variables
            .iter()
            .find(|v| v.name == variable_name)
            .map(|v| v.id);
        let Some(variable_id) = variable_id else {
            return 0;
        };
        self.values
            .iter()
            .filter(|e| {
                e.key().user_id == user_id
                    && e.key().variable_id == variable_id
                    && e.key().key == key
            })
            .count()
    }
}

impl Default for InMemoryGameStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GameStore for InMemoryGameStore {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserRow>, StoreError> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn upsert_user(&self, user: &UserRow) -> Result<(), StoreError> {
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn existing_user_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        Ok(ids
            .iter()
            .copied()
            .filter(|id| self.users.contains_key(id))
            .collect())
    }

    async fn create_users(&self, users: &[UserRow]) -> Result<(), StoreError> {
        for user in users {
            self.users.entry(user.id).or_insert_with(|| user.clone());
        }
        Ok(())
    }

    async fn friends_of(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        let mut out: Vec<i64> = self
            .friend_edges
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.key().1)
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    async fn friended_by(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        let mut out: Vec<i64> = self
            .friend_edges
            .iter()
            .filter(|e| e.key().1 == user_id)
            .map(|e| e.key().0)
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    async fn add_friends(&self, user_id: i64, to_ids: &[i64]) -> Result<(), StoreError> {
        for to in to_ids {
            self.friend_edges.insert((user_id, *to), ());
        }
        Ok(())
    }

    async fn remove_friends(&self, user_id: i64, to_ids: &[i64]) -> Result<(), StoreError> {
        for to in to_ids {
            self.friend_edges.remove(&(user_id, *to));
        }
        Ok(())
    }

    async fn existing_group_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        Ok(ids
            .iter()
            .copied()
            .filter(|id| self.groups.contains_key(id))
            .collect())
    }

    async fn create_groups(&self, ids: &[i64]) -> Result<(), StoreError> {
        for id in ids {
            self.groups.insert(*id, ());
        }
        Ok(())
    }

    async fn groups_of_user(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        let mut out: Vec<i64> = self
            .memberships
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.key().1)
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    async fn add_group_memberships(
        &self,
        user_id: i64,
        group_ids: &[i64],
    ) -> Result<(), StoreError> {
        for group in group_ids {
            self.memberships.insert((user_id, *group), ());
        }
        Ok(())
    }

    async fn remove_group_memberships(
        &self,
        user_id: i64,
        group_ids: &[i64],
    ) -> Result<(), StoreError> {
        for group in group_ids {
            self.memberships.remove(&(user_id, *group));
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> Result<(), StoreError> {
        self.levels.retain(|(uid, _, _), _| *uid != user_id);
        self.goal_cache.retain(|(_, uid), _| *uid != user_id);
        self.friend_edges
            .retain(|(from, to), _| *from != user_id && *to != user_id);
        self.memberships.retain(|(uid, _), _| *uid != user_id);
        self.values.retain(|key, _| key.user_id != user_id);
        self.users.remove(&user_id);
        Ok(())
    }

    async fn variable_by_name(&self, name: &str) -> Result<Option<VariableRow>, StoreError> {
        Ok(self
            .variables
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.clone()))
    }

    async fn all_variables(&self) -> Result<Vec<VariableRow>, StoreError> {
        let mut out: Vec<VariableRow> = self.variables.iter().map(|v| v.clone()).collect();
        out.sort_by_key(|v| v.id);
        Ok(out)
    }

    async fn create_variable(
        &self,
        name: &str,
        group: VariableGroup,
        increase_permission: IncreasePermission,
    ) -> Result<VariableRow, StoreError> {
        if self.variables.iter().any(|v| v.name == name) {
            return Err(StoreError::Conflict);
        }
        let id = self.variable_seq.fetch_add(1, Ordering::SeqCst);
        let row = VariableRow {
            id,
            name: name.to_string(),
            group,
            increase_permission,
        };
        self.variables.insert(id, row.clone());
        Ok(row)
    }

    async fn add_value(
        &self,
        user_id: i64,
        variable_id: i32,
        datetime: DateTime<Utc>,
        key: &str,
        amount: i64,
    ) -> Result<(), StoreError> {
        let value_key = ValueKey {
            user_id,
            variable_id,
            datetime,
            key: key.to_string(),
        };
        // entry() makes the read-modify-write atomic per row
        *self.values.entry(value_key).or_insert(0) += amount;
        Ok(())
    }

    async fn values_for_user(&self, user_id: i64) -> Result<Vec<UserValueRow>, StoreError> {
        let mut out = Vec::new();
        for entry in self.values.iter() {
            let key = entry.key();
            if key.user_id != user_id {
                continue;
            }
            let variable_name = match self.variables.get(&key.variable_id) {
                Some(v) => v.name.clone(),
                None => continue,
            };
            out.push(UserValueRow {
                variable_id: key.variable_id,
                variable_name,
                datetime: key.datetime,
                key: key.key.clone(),
                value: *entry.value(),
            });
        }
        out.sort_by(|a, b| a.datetime.cmp(&b.datetime).then(a.key.cmp(&b.key)));
        Ok(out)
    }

    async fn get_achievement(
        &self,
        achievement_id: i32,
    ) -> Result<Option<AchievementRow>, StoreError> {
        Ok(self.achievements.get(&achievement_id).map(|a| a.clone()))
    }

    async fn all_achievements(&self) -> Result<Vec<AchievementRow>, StoreError> {
        let mut out: Vec<AchievementRow> = self.achievements.iter().map(|a| a.clone()).collect();
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    async fn achievements_valid_on(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<AchievementRow>, StoreError> {
        let mut out: Vec<AchievementRow> = self
            .achievements
            .iter()
            .filter(|a| {
                a.valid_start.map(|s| s <= date).unwrap_or(true)
                    && a.valid_end.map(|e| e >= date).unwrap_or(true)
            })
            .map(|a| a.clone())
            .collect();
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    async fn goals_for_achievement(&self, achievement_id: i32) -> Result<Vec<GoalRow>, StoreError> {
        let mut out: Vec<GoalRow> = self
            .goals
            .iter()
            .filter(|g| g.achievement_id == achievement_id)
            .map(|g| g.clone())
            .collect();
        out.sort_by_key(|g| g.id);
        Ok(out)
    }

    async fn all_goals(&self) -> Result<Vec<GoalRow>, StoreError> {
        let mut out: Vec<GoalRow> = self.goals.iter().map(|g| g.clone()).collect();
        out.sort_by_key(|g| g.id);
        Ok(out)
    }

    async fn get_category(
        &self,
        category_id: i32,
    ) -> Result<Option<AchievementCategoryRow>, StoreError> {
        Ok(self.categories.get(&category_id).map(|c| c.clone()))
    }

    async fn rewards_for_achievement(
        &self,
        achievement_id: i32,
    ) -> Result<Vec<AchievementRewardRow>, StoreError> {
        Ok(self
            .rewards
            .get(&achievement_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn properties_for_achievement(
        &self,
        achievement_id: i32,
    ) -> Result<Vec<AchievementPropertyRow>, StoreError> {
        Ok(self
            .achievement_properties
            .get(&achievement_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn properties_for_goal(&self, goal_id: i32) -> Result<Vec<GoalPropertyRow>, StoreError> {
        Ok(self
            .goal_properties
            .get(&goal_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn upsert_achievement_property(
        &self,
        name: &str,
        is_variable: bool,
    ) -> Result<AchievementPropertyDef, StoreError> {
        if let Some(mut existing) = self
            .property_defs
            .iter_mut()
            .find(|d| d.name == name)
        {
            existing.is_variable = is_variable;
            return Ok(existing.clone());
        }
        let id = self.property_seq.fetch_add(1, Ordering::SeqCst);
        let def = AchievementPropertyDef {
            id,
            name: name.to_string(),
            is_variable,
        };
        self.property_defs.insert(id, def.clone());
        Ok(def)
    }

    async fn levels_for(
        &self,
        user_id: i64,
        achievement_id: i32,
    ) -> Result<Vec<AchievementLevelRow>, StoreError> {
        let mut out: Vec<AchievementLevelRow> = self
            .levels
            .iter()
            .filter(|e| e.key().0 == user_id && e.key().1 == achievement_id)
            .map(|e| AchievementLevelRow {
                user_id: e.key().0,
                achievement_id: e.key().1,
                level: e.key().2,
                awarded_at: *e.value(),
            })
            .collect();
        out.sort_by(|a, b| b.level.cmp(&a.level));
        Ok(out)
    }

    async fn insert_level(
        &self,
        user_id: i64,
        achievement_id: i32,
        level: i32,
    ) -> Result<(), StoreError> {
        match self.levels.entry((user_id, achievement_id, level)) {
            Entry::Occupied(_) => Err(StoreError::Conflict),
            Entry::Vacant(vacant) => {
                vacant.insert(Utc::now());
                Ok(())
            }
        }
    }

    async fn get_goal_cache(
        &self,
        goal_id: i32,
        user_id: i64,
    ) -> Result<Option<GoalCacheRow>, StoreError> {
        Ok(self.goal_cache.get(&(goal_id, user_id)).map(|r| r.clone()))
    }

    async fn goal_cache_for_users(
        &self,
        goal_id: i32,
        user_ids: &[i64],
    ) -> Result<Vec<GoalCacheRow>, StoreError> {
        let wanted: HashSet<i64> = user_ids.iter().copied().collect();
        let mut out: Vec<GoalCacheRow> = self
            .goal_cache
            .iter()
            .filter(|e| e.key().0 == goal_id && wanted.contains(&e.key().1))
            .map(|e| e.clone())
            .collect();
        out.sort_by_key(|r| r.user_id);
        Ok(out)
    }

    async fn upsert_goal_cache(&self, row: &GoalCacheRow) -> Result<(), StoreError> {
        self.goal_cache
            .insert((row.goal_id, row.user_id), row.clone());
        Ok(())
    }

    async fn delete_goal_cache(&self, user_id: i64, goal_ids: &[i32]) -> Result<(), StoreError> {
        for goal_id in goal_ids {
            self.goal_cache.remove(&(*goal_id, user_id));
        }
        Ok(())
    }

    async fn translations_for(
        &self,
        translation_id: i32,
    ) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .translations
            .get(&translation_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn languages(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.languages.lock().unwrap().clone())
    }
}
