// SQLite implementation of GameStore.
//
// Schema notes:
// - `values` collapses increments by upsert-add on the composite primary
//   key (user_id, variable_id, datetime, key).
// - `achievements_users` carries a composite primary key
//   (user_id, achievement_id, level); the unique violation on insert is
//   surfaced as StoreError::Conflict so the evaluator can treat it as
//   "another worker already awarded this level".
// - `goal_evaluation_cache` is the durable mirror of the goal memo, keyed
//   by (goal_id, user_id).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashSet;
use std::path::Path;

use crate::core::engine::models::{
    AchievementCategoryRow, AchievementLevelRow, AchievementPropertyDef, AchievementPropertyRow,
    AchievementRewardRow, AchievementRow, Evaluation, GoalCacheRow, GoalOperator, GoalPropertyRow,
    GoalRow, IncreasePermission, MaxMin, Relevance, UserRow, UserValueRow, VariableGroup,
    VariableRow, ViewPermission,
};
use crate::core::engine::store::{GameStore, StoreError};

pub struct SqliteGameStore {
    pool: Pool<Sqlite>,
}

fn map_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
        _ => StoreError::Database(e.to_string()),
    }
}

impl SqliteGameStore {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Ensure the file exists if it's a file path
        let path_str = database_url.trim_start_matches("sqlite://");
        if !database_url.contains(":memory:") && !Path::new(path_str).exists() {
            if let Some(parent) = Path::new(path_str).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(path_str)?;
        }

        let conn_str = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let pool = SqlitePoolOptions::new().connect(&conn_str).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                lat REAL,
                lng REAL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                country TEXT,
                region TEXT,
                city TEXT,
                created_at TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS users_users (
                from_id INTEGER NOT NULL,
                to_id INTEGER NOT NULL,
                PRIMARY KEY (from_id, to_id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS users_groups (
                user_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, group_id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS variables (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                "group" TEXT NOT NULL DEFAULT 'none',
                increase_permission TEXT NOT NULL DEFAULT 'admin'
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS "values" (
                user_id INTEGER NOT NULL,
                variable_id INTEGER NOT NULL,
                datetime TEXT NOT NULL,
                key TEXT NOT NULL DEFAULT '',
                value INTEGER NOT NULL,
                PRIMARY KEY (user_id, variable_id, datetime, key)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS achievementcategories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS achievements (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                achievementcategory_id INTEGER,
                maxlevel INTEGER NOT NULL DEFAULT 1,
                hidden BOOLEAN NOT NULL DEFAULT 0,
                valid_start TEXT,
                valid_end TEXT,
                lat REAL,
                lng REAL,
                max_distance INTEGER,
                priority INTEGER NOT NULL DEFAULT 0,
                relevance TEXT NOT NULL DEFAULT 'own',
                view_permission TEXT NOT NULL DEFAULT 'everyone'
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS goals (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                name_translation_id INTEGER,
                condition TEXT,
                evaluation TEXT NOT NULL DEFAULT 'immediately',
                timespan INTEGER,
                group_by_key BOOLEAN NOT NULL DEFAULT 0,
                group_by_dateformat TEXT,
                goal TEXT,
                operator TEXT,
                maxmin TEXT NOT NULL DEFAULT 'max',
                achievement_id INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS goal_evaluation_cache (
                goal_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                achieved BOOLEAN NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (goal_id, user_id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS achievementproperties (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                is_variable BOOLEAN NOT NULL DEFAULT 0
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS achievements_achievementproperties (
                achievement_id INTEGER NOT NULL,
                property_id INTEGER NOT NULL,
                value TEXT,
                value_translation_id INTEGER,
                from_level INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (achievement_id, property_id, from_level)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS goalproperties (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                is_variable BOOLEAN NOT NULL DEFAULT 0
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS goals_goalproperties (
                goal_id INTEGER NOT NULL,
                property_id INTEGER NOT NULL,
                value TEXT,
                value_translation_id INTEGER,
                from_level INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (goal_id, property_id, from_level)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rewards (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS achievements_rewards (
                id INTEGER PRIMARY KEY,
                achievement_id INTEGER NOT NULL,
                reward_id INTEGER NOT NULL,
                value TEXT,
                value_translation_id INTEGER,
                from_level INTEGER NOT NULL DEFAULT 1
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS achievements_users (
                user_id INTEGER NOT NULL,
                achievement_id INTEGER NOT NULL,
                level INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, achievement_id, level)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS languages (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS translationvariables (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT ''
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS translations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                translationvariable_id INTEGER NOT NULL,
                language_id INTEGER NOT NULL,
                text TEXT NOT NULL
            );
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // catalog loading (used by setup code and tests; not part of the port)
    // ------------------------------------------------------------------

    pub async fn insert_category(
        &self,
        category: &AchievementCategoryRow,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO achievementcategories (id, name) VALUES (?, ?)")
            .bind(category.id)
            .bind(&category.name)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_achievement(&self, achievement: &AchievementRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO achievements (
                id, name, achievementcategory_id, maxlevel, hidden,
                valid_start, valid_end, lat, lng, max_distance, priority,
                relevance, view_permission
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(achievement.id)
        .bind(&achievement.name)
        .bind(achievement.category_id)
        .bind(achievement.maxlevel)
        .bind(achievement.hidden)
        .bind(achievement.valid_start)
        .bind(achievement.valid_end)
        .bind(achievement.lat)
        .bind(achievement.lng)
        .bind(achievement.max_distance)
        .bind(achievement.priority)
        .bind(achievement.relevance.as_str())
        .bind(achievement.view_permission.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_goal(&self, goal: &GoalRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO goals (
                id, name, name_translation_id, condition, evaluation,
                timespan, group_by_key, group_by_dateformat, goal, operator,
                maxmin, achievement_id, priority
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(goal.id)
        .bind(&goal.name)
        .bind(goal.name_translation_id)
        .bind(&goal.condition)
        .bind(goal.evaluation.as_str())
        .bind(goal.timespan)
        .bind(goal.group_by_key)
        .bind(&goal.group_by_dateformat)
        .bind(&goal.goal)
        .bind(goal.operator.map(|o| o.as_str()))
        .bind(goal.maxmin.as_str())
        .bind(goal.achievement_id)
        .bind(goal.priority)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_reward_row(
        &self,
        achievement_id: i32,
        row: &AchievementRewardRow,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO rewards (id, name) VALUES (?, ?)")
            .bind(row.reward_id)
            .bind(&row.name)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        sqlx::query(
            r#"
            INSERT INTO achievements_rewards
                (id, achievement_id, reward_id, value, value_translation_id, from_level)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id)
        .bind(achievement_id)
        .bind(row.reward_id)
        .bind(&row.value)
        .bind(row.value_translation_id)
        .bind(row.from_level)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_achievement_property_row(
        &self,
        achievement_id: i32,
        row: &AchievementPropertyRow,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO achievementproperties (id, name, is_variable) VALUES (?, ?, ?)")
            .bind(row.property_id)
            .bind(&row.name)
            .bind(row.is_variable)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        sqlx::query(
            r#"
            INSERT INTO achievements_achievementproperties
                (achievement_id, property_id, value, value_translation_id, from_level)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(achievement_id)
        .bind(row.property_id)
        .bind(&row.value)
        .bind(row.value_translation_id)
        .bind(row.from_level)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_goal_property_row(
        &self,
        goal_id: i32,
        row: &GoalPropertyRow,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO goalproperties (id, name, is_variable) VALUES (?, ?, ?)")
            .bind(row.property_id)
            .bind(&row.name)
            .bind(row.is_variable)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        sqlx::query(
            r#"
            INSERT INTO goals_goalproperties
                (goal_id, property_id, value, value_translation_id, from_level)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(goal_id)
        .bind(row.property_id)
        .bind(&row.value)
        .bind(row.value_translation_id)
        .bind(row.from_level)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_language(&self, id: i32, name: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO languages (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_translation(
        &self,
        translation_id: i32,
        language_id: i32,
        text: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO translationvariables (id, name) VALUES (?, '')")
            .bind(translation_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        sqlx::query(
            "INSERT INTO translations (translationvariable_id, language_id, text) VALUES (?, ?, ?)",
        )
        .bind(translation_id)
        .bind(language_id)
        .bind(text)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> UserRow {
    UserRow {
        id: row.get::<i64, _>("id"),
        lat: row.get("lat"),
        lng: row.get("lng"),
        timezone: row.get("timezone"),
        country: row.get("country"),
        region: row.get("region"),
        city: row.get("city"),
        created_at: row.get("created_at"),
    }
}

fn row_to_variable(row: &sqlx::sqlite::SqliteRow) -> VariableRow {
    VariableRow {
        id: row.get::<i64, _>("id") as i32,
        name: row.get("name"),
        group: VariableGroup::parse(&row.get::<String, _>("group"))
            .unwrap_or(VariableGroup::None),
        increase_permission: IncreasePermission::parse(
            &row.get::<String, _>("increase_permission"),
        )
        .unwrap_or(IncreasePermission::Admin),
    }
}

fn row_to_achievement(row: &sqlx::sqlite::SqliteRow) -> AchievementRow {
    AchievementRow {
        id: row.get::<i64, _>("id") as i32,
        name: row.get("name"),
        category_id: row
            .get::<Option<i64>, _>("achievementcategory_id")
            .map(|id| id as i32),
        maxlevel: row.get::<i64, _>("maxlevel") as i32,
        hidden: row.get("hidden"),
        valid_start: row.get("valid_start"),
        valid_end: row.get("valid_end"),
        lat: row.get("lat"),
        lng: row.get("lng"),
        max_distance: row.get::<Option<i64>, _>("max_distance").map(|d| d as i32),
        priority: row.get::<i64, _>("priority") as i32,
        relevance: Relevance::parse(&row.get::<String, _>("relevance")).unwrap_or(Relevance::Own),
        view_permission: ViewPermission::parse(&row.get::<String, _>("view_permission"))
            .unwrap_or(ViewPermission::Everyone),
    }
}

fn row_to_goal(row: &sqlx::sqlite::SqliteRow) -> GoalRow {
    GoalRow {
        id: row.get::<i64, _>("id") as i32,
        name: row.get("name"),
        name_translation_id: row
            .get::<Option<i64>, _>("name_translation_id")
            .map(|id| id as i32),
        condition: row.get("condition"),
        evaluation: Evaluation::parse(&row.get::<String, _>("evaluation"))
            .unwrap_or(Evaluation::Immediately),
        timespan: row.get::<Option<i64>, _>("timespan").map(|t| t as i32),
        group_by_key: row.get("group_by_key"),
        group_by_dateformat: row.get("group_by_dateformat"),
        goal: row.get("goal"),
        operator: row
            .get::<Option<String>, _>("operator")
            .and_then(|o| GoalOperator::parse(&o)),
        maxmin: MaxMin::parse(&row.get::<String, _>("maxmin")).unwrap_or(MaxMin::Max),
        achievement_id: row.get::<i64, _>("achievement_id") as i32,
        priority: row.get::<i64, _>("priority") as i32,
    }
}

// ============================================================================
// PORT IMPLEMENTATION
// ============================================================================

#[async_trait]
impl GameStore for SqliteGameStore {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.map(|r| row_to_user(&r)))
    }

    async fn upsert_user(&self, user: &UserRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, lat, lng, timezone, country, region, city, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                lat = excluded.lat,
                lng = excluded.lng,
                timezone = excluded.timezone,
                country = excluded.country,
                region = excluded.region,
                city = excluded.city
            "#,
        )
        .bind(user.id)
        .bind(user.lat)
        .bind(user.lng)
        .bind(&user.timezone)
        .bind(&user.country)
        .bind(&user.region)
        .bind(&user.city)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn existing_user_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id FROM users WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_err)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    async fn create_users(&self, users: &[UserRow]) -> Result<(), StoreError> {
        for user in users {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO users (id, lat, lng, timezone, country, region, city, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(user.id)
            .bind(user.lat)
            .bind(user.lng)
            .bind(&user.timezone)
            .bind(&user.country)
            .bind(&user.region)
            .bind(&user.city)
            .bind(user.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        }
        Ok(())
    }

    async fn friends_of(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT to_id FROM users_users WHERE from_id = ? ORDER BY to_id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("to_id")).collect())
    }

    async fn friended_by(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT from_id FROM users_users WHERE to_id = ? ORDER BY from_id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("from_id")).collect())
    }

    async fn add_friends(&self, user_id: i64, to_ids: &[i64]) -> Result<(), StoreError> {
        for to in to_ids {
            sqlx::query("INSERT OR IGNORE INTO users_users (from_id, to_id) VALUES (?, ?)")
                .bind(user_id)
                .bind(to)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn remove_friends(&self, user_id: i64, to_ids: &[i64]) -> Result<(), StoreError> {
        if to_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; to_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM users_users WHERE from_id = ? AND to_id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(user_id);
        for to in to_ids {
            query = query.bind(to);
        }
        query.execute(&self.pool).await.map_err(map_err)?;
        Ok(())
    }

    async fn existing_group_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id FROM groups WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_err)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    async fn create_groups(&self, ids: &[i64]) -> Result<(), StoreError> {
        for id in ids {
            sqlx::query("INSERT OR IGNORE INTO groups (id) VALUES (?)")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn groups_of_user(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows =
            sqlx::query("SELECT group_id FROM users_groups WHERE user_id = ? ORDER BY group_id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("group_id")).collect())
    }

    async fn add_group_memberships(
        &self,
        user_id: i64,
        group_ids: &[i64],
    ) -> Result<(), StoreError> {
        for group in group_ids {
            sqlx::query("INSERT OR IGNORE INTO users_groups (user_id, group_id) VALUES (?, ?)")
                .bind(user_id)
                .bind(group)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn remove_group_memberships(
        &self,
        user_id: i64,
        group_ids: &[i64],
    ) -> Result<(), StoreError> {
        if group_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; group_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM users_groups WHERE user_id = ? AND group_id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(user_id);
        for group in group_ids {
            query = query.bind(group);
        }
        query.execute(&self.pool).await.map_err(map_err)?;
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> Result<(), StoreError> {
        let statements = [
            "DELETE FROM achievements_users WHERE user_id = ?",
            "DELETE FROM goal_evaluation_cache WHERE user_id = ?",
            "DELETE FROM users_users WHERE to_id = ?",
            "DELETE FROM users_users WHERE from_id = ?",
            "DELETE FROM users_groups WHERE user_id = ?",
            "DELETE FROM \"values\" WHERE user_id = ?",
            "DELETE FROM users WHERE id = ?",
        ];
        for statement in statements {
            sqlx::query(statement)
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn variable_by_name(&self, name: &str) -> Result<Option<VariableRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM variables WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.map(|r| row_to_variable(&r)))
    }

    async fn all_variables(&self) -> Result<Vec<VariableRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM variables ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(rows.iter().map(row_to_variable).collect())
    }

    async fn create_variable(
        &self,
        name: &str,
        group: VariableGroup,
        increase_permission: IncreasePermission,
    ) -> Result<VariableRow, StoreError> {
        let result = sqlx::query(
            "INSERT INTO variables (name, \"group\", increase_permission) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(group.as_str())
        .bind(increase_permission.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(VariableRow {
            id: result.last_insert_rowid() as i32,
            name: name.to_string(),
            group,
            increase_permission,
        })
    }

    async fn add_value(
        &self,
        user_id: i64,
        variable_id: i32,
        datetime: DateTime<Utc>,
        key: &str,
        amount: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "values" (user_id, variable_id, datetime, key, value)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, variable_id, datetime, key) DO UPDATE SET
                value = value + excluded.value
            "#,
        )
        .bind(user_id)
        .bind(variable_id)
        .bind(datetime)
        .bind(key)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn values_for_user(&self, user_id: i64) -> Result<Vec<UserValueRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT v.variable_id, vr.name AS variable_name, v.datetime, v.key, v.value
            FROM "values" v
            JOIN variables vr ON vr.id = v.variable_id
            WHERE v.user_id = ?
            ORDER BY v.datetime, v.key
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(rows
            .iter()
            .map(|r| UserValueRow {
                variable_id: r.get::<i64, _>("variable_id") as i32,
                variable_name: r.get("variable_name"),
                datetime: r.get("datetime"),
                key: r.get("key"),
                value: r.get::<i64, _>("value"),
            })
            .collect())
    }

    async fn get_achievement(
        &self,
        achievement_id: i32,
    ) -> Result<Option<AchievementRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM achievements WHERE id = ?")
            .bind(achievement_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.map(|r| row_to_achievement(&r)))
    }

    async fn all_achievements(&self) -> Result<Vec<AchievementRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM achievements ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(rows.iter().map(row_to_achievement).collect())
    }

    async fn achievements_valid_on(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<AchievementRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM achievements
            WHERE (valid_start IS NULL OR valid_start <= ?)
              AND (valid_end IS NULL OR valid_end >= ?)
            ORDER BY id
            "#,
        )
        .bind(date)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(rows.iter().map(row_to_achievement).collect())
    }

    async fn goals_for_achievement(&self, achievement_id: i32) -> Result<Vec<GoalRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM goals WHERE achievement_id = ? ORDER BY id")
            .bind(achievement_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(rows.iter().map(row_to_goal).collect())
    }

    async fn all_goals(&self) -> Result<Vec<GoalRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM goals ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(rows.iter().map(row_to_goal).collect())
    }

    async fn get_category(
        &self,
        category_id: i32,
    ) -> Result<Option<AchievementCategoryRow>, StoreError> {
        let row = sqlx::query("SELECT id, name FROM achievementcategories WHERE id = ?")
            .bind(category_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.map(|r| AchievementCategoryRow {
            id: r.get::<i64, _>("id") as i32,
            name: r.get("name"),
        }))
    }

    async fn rewards_for_achievement(
        &self,
        achievement_id: i32,
    ) -> Result<Vec<AchievementRewardRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ar.id, ar.reward_id, r.name, ar.from_level, ar.value, ar.value_translation_id
            FROM achievements_rewards ar
            JOIN rewards r ON r.id = ar.reward_id
            WHERE ar.achievement_id = ?
            ORDER BY ar.from_level, ar.id
            "#,
        )
        .bind(achievement_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(rows
            .iter()
            .map(|r| AchievementRewardRow {
                id: r.get::<i64, _>("id") as i32,
                reward_id: r.get::<i64, _>("reward_id") as i32,
                name: r.get("name"),
                from_level: r.get::<i64, _>("from_level") as i32,
                value: r.get("value"),
                value_translation_id: r
                    .get::<Option<i64>, _>("value_translation_id")
                    .map(|id| id as i32),
            })
            .collect())
    }

    async fn properties_for_achievement(
        &self,
        achievement_id: i32,
    ) -> Result<Vec<AchievementPropertyRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id AS property_id, p.name, p.is_variable,
                   ap.from_level, ap.value, ap.value_translation_id
            FROM achievementproperties p
            JOIN achievements_achievementproperties ap ON ap.property_id = p.id
            WHERE ap.achievement_id = ?
            ORDER BY ap.from_level, p.id
            "#,
        )
        .bind(achievement_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(rows
            .iter()
            .map(|r| AchievementPropertyRow {
                property_id: r.get::<i64, _>("property_id") as i32,
                name: r.get("name"),
                is_variable: r.get("is_variable"),
                from_level: r.get::<i64, _>("from_level") as i32,
                value: r.get("value"),
                value_translation_id: r
                    .get::<Option<i64>, _>("value_translation_id")
                    .map(|id| id as i32),
            })
            .collect())
    }

    async fn properties_for_goal(&self, goal_id: i32) -> Result<Vec<GoalPropertyRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id AS property_id, p.name, p.is_variable,
                   gp.from_level, gp.value, gp.value_translation_id
            FROM goalproperties p
            JOIN goals_goalproperties gp ON gp.property_id = p.id
            WHERE gp.goal_id = ?
            ORDER BY gp.from_level, p.id
            "#,
        )
        .bind(goal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(rows
            .iter()
            .map(|r| GoalPropertyRow {
                property_id: r.get::<i64, _>("property_id") as i32,
                name: r.get("name"),
                is_variable: r.get("is_variable"),
                from_level: r.get::<i64, _>("from_level") as i32,
                value: r.get("value"),
                value_translation_id: r
                    .get::<Option<i64>, _>("value_translation_id")
                    .map(|id| id as i32),
            })
            .collect())
    }

    async fn upsert_achievement_property(
        &self,
        name: &str,
        is_variable: bool,
    ) -> Result<AchievementPropertyDef, StoreError> {
        let existing = sqlx::query("SELECT id FROM achievementproperties WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;

        let id = match existing {
            Some(row) => {
                let id = row.get::<i64, _>("id");
                sqlx::query("UPDATE achievementproperties SET is_variable = ? WHERE id = ?")
                    .bind(is_variable)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(map_err)?;
                id
            }
            None => {
                let result =
                    sqlx::query("INSERT INTO achievementproperties (name, is_variable) VALUES (?, ?)")
                        .bind(name)
                        .bind(is_variable)
                        .execute(&self.pool)
                        .await
                        .map_err(map_err)?;
                result.last_insert_rowid()
            }
        };

        Ok(AchievementPropertyDef {
            id: id as i32,
            name: name.to_string(),
            is_variable,
        })
    }

    async fn levels_for(
        &self,
        user_id: i64,
        achievement_id: i32,
    ) -> Result<Vec<AchievementLevelRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT level, updated_at FROM achievements_users
            WHERE user_id = ? AND achievement_id = ?
            ORDER BY level DESC
            "#,
        )
        .bind(user_id)
        .bind(achievement_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(rows
            .iter()
            .map(|r| AchievementLevelRow {
                user_id,
                achievement_id,
                level: r.get::<i64, _>("level") as i32,
                awarded_at: r.get("updated_at"),
            })
            .collect())
    }

    async fn insert_level(
        &self,
        user_id: i64,
        achievement_id: i32,
        level: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO achievements_users (user_id, achievement_id, level, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(achievement_id)
        .bind(level)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_goal_cache(
        &self,
        goal_id: i32,
        user_id: i64,
    ) -> Result<Option<GoalCacheRow>, StoreError> {
        let row = sqlx::query(
            "SELECT value, achieved FROM goal_evaluation_cache WHERE goal_id = ? AND user_id = ?",
        )
        .bind(goal_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(row.map(|r| GoalCacheRow {
            goal_id,
            user_id,
            value: r.get("value"),
            achieved: r.get("achieved"),
        }))
    }

    async fn goal_cache_for_users(
        &self,
        goal_id: i32,
        user_ids: &[i64],
    ) -> Result<Vec<GoalCacheRow>, StoreError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT user_id, value, achieved FROM goal_evaluation_cache \
             WHERE goal_id = ? AND user_id IN ({}) ORDER BY user_id",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(goal_id);
        for user_id in user_ids {
            query = query.bind(user_id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_err)?;

        Ok(rows
            .iter()
            .map(|r| GoalCacheRow {
                goal_id,
                user_id: r.get::<i64, _>("user_id"),
                value: r.get("value"),
                achieved: r.get("achieved"),
            })
            .collect())
    }

    async fn upsert_goal_cache(&self, row: &GoalCacheRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO goal_evaluation_cache (goal_id, user_id, value, achieved)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(goal_id, user_id) DO UPDATE SET
                value = excluded.value,
                achieved = excluded.achieved
            "#,
        )
        .bind(row.goal_id)
        .bind(row.user_id)
        .bind(row.value)
        .bind(row.achieved)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn delete_goal_cache(&self, user_id: i64, goal_ids: &[i32]) -> Result<(), StoreError> {
        if goal_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; goal_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM goal_evaluation_cache WHERE user_id = ? AND goal_id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(user_id);
        for goal_id in goal_ids {
            query = query.bind(goal_id);
        }
        query.execute(&self.pool).await.map_err(map_err)?;
        Ok(())
    }

    async fn translations_for(
        &self,
        translation_id: i32,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT l.name, t.text
            FROM translations t
            JOIN languages l ON l.id = t.language_id
            WHERE t.translationvariable_id = ?
            ORDER BY l.id
            "#,
        )
        .bind(translation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("name"), r.get::<String, _>("text")))
            .collect())
    }

    async fn languages(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT name FROM languages ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::models::{Evaluation, GoalOperator, MaxMin};
    use crate::core::engine::GamificationService;

    async fn temp_store() -> (tempfile::TempDir, SqliteGameStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("questline.db");
        let store = SqliteGameStore::new(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_add_value_upserts_by_identity() {
        let (_dir, store) = temp_store().await;
        let variable = store
            .create_variable("points", VariableGroup::Day, IncreasePermission::Admin)
            .await
            .unwrap();
        store
            .upsert_user(&UserRow::bare(1, Utc::now()))
            .await
            .unwrap();

        let bucket = Utc::now();
        store.add_value(1, variable.id, bucket, "", 40).await.unwrap();
        store.add_value(1, variable.id, bucket, "", 70).await.unwrap();

        let rows = store.values_for_user(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 110);
        assert_eq!(rows[0].variable_name, "points");
    }

    #[tokio::test]
    async fn test_insert_level_duplicate_is_conflict() {
        let (_dir, store) = temp_store().await;
        store.insert_level(1, 1, 1).await.unwrap();
        assert!(matches!(
            store.insert_level(1, 1, 1).await,
            Err(StoreError::Conflict)
        ));
        // a different level for the same pair is fine
        store.insert_level(1, 1, 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_variable_name_is_unique() {
        let (_dir, store) = temp_store().await;
        store
            .create_variable("xp", VariableGroup::Day, IncreasePermission::Admin)
            .await
            .unwrap();
        assert!(matches!(
            store
                .create_variable("xp", VariableGroup::None, IncreasePermission::Own)
                .await,
            Err(StoreError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_goal_cache_roundtrip_and_delete() {
        let (_dir, store) = temp_store().await;
        store
            .upsert_goal_cache(&GoalCacheRow {
                goal_id: 5,
                user_id: 9,
                value: 120.0,
                achieved: false,
            })
            .await
            .unwrap();
        store
            .upsert_goal_cache(&GoalCacheRow {
                goal_id: 5,
                user_id: 9,
                value: 200.0,
                achieved: true,
            })
            .await
            .unwrap();

        let row = store.get_goal_cache(5, 9).await.unwrap().unwrap();
        assert_eq!(row.value, 200.0);
        assert!(row.achieved);

        store.delete_goal_cache(9, &[5]).await.unwrap();
        assert!(store.get_goal_cache(5, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_achievements_valid_on() {
        let (_dir, store) = temp_store().await;
        let mut achievement = sample_achievement(1);
        achievement.valid_start = NaiveDate::from_ymd_opt(2026, 1, 1);
        achievement.valid_end = NaiveDate::from_ymd_opt(2026, 1, 31);
        store.insert_achievement(&achievement).await.unwrap();
        store.insert_achievement(&sample_achievement(2)).await.unwrap();

        let in_window = store
            .achievements_valid_on(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap())
            .await
            .unwrap();
        assert_eq!(in_window.len(), 2);

        let out_of_window = store
            .achievements_valid_on(NaiveDate::from_ymd_opt(2026, 2, 15).unwrap())
            .await
            .unwrap();
        assert_eq!(out_of_window.len(), 1);
        assert_eq!(out_of_window[0].id, 2);
    }

    #[tokio::test]
    async fn test_translations_join() {
        let (_dir, store) = temp_store().await;
        store.insert_language(1, "en").await.unwrap();
        store.insert_language(2, "de").await.unwrap();
        store.insert_translation(10, 1, "'Hello'").await.unwrap();
        store.insert_translation(10, 2, "'Hallo'").await.unwrap();

        let rows = store.translations_for(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("en".to_string(), "'Hello'".to_string()));
        assert_eq!(store.languages().await.unwrap(), vec!["en", "de"]);
    }

    #[tokio::test]
    async fn test_friend_edges_both_directions() {
        let (_dir, store) = temp_store().await;
        store.add_friends(1, &[2, 3]).await.unwrap();
        store.add_friends(2, &[1]).await.unwrap();

        assert_eq!(store.friends_of(1).await.unwrap(), vec![2, 3]);
        assert_eq!(store.friended_by(1).await.unwrap(), vec![2]);

        store.remove_friends(1, &[3]).await.unwrap();
        assert_eq!(store.friends_of(1).await.unwrap(), vec![2]);
    }

    fn sample_achievement(id: i32) -> AchievementRow {
        AchievementRow {
            id,
            name: format!("achievement_{}", id),
            category_id: None,
            maxlevel: 3,
            hidden: false,
            valid_start: None,
            valid_end: None,
            lat: None,
            lng: None,
            max_distance: None,
            priority: 0,
            relevance: Relevance::Own,
            view_permission: ViewPermission::Everyone,
        }
    }

    #[tokio::test]
    async fn test_engine_runs_against_sqlite() {
        let (_dir, store) = temp_store().await;
        store
            .upsert_user(&UserRow::bare(1, Utc::now()))
            .await
            .unwrap();
        store
            .create_variable("points", VariableGroup::Day, IncreasePermission::Admin)
            .await
            .unwrap();
        store.insert_achievement(&sample_achievement(1)).await.unwrap();
        store
            .insert_goal(&GoalRow {
                id: 1,
                name: "collect points".to_string(),
                name_translation_id: None,
                condition: Some("variable_name == \"points\"".to_string()),
                evaluation: Evaluation::Immediately,
                timespan: None,
                group_by_key: false,
                group_by_dateformat: None,
                goal: Some("level*100".to_string()),
                operator: Some(GoalOperator::Geq),
                maxmin: MaxMin::Max,
                achievement_id: 1,
                priority: 0,
            })
            .await
            .unwrap();

        let service = GamificationService::new(store);
        service.increase_value("points", 1, 40, "").await.unwrap();
        service.increase_value("points", 1, 70, "").await.unwrap();

        let state = service.evaluate_achievement(1, 1).await.unwrap();
        assert_eq!(state.level, 1);
        assert!(state.new_levels.contains_key("1"));
        // the next level's threshold is visible to clients
        assert_eq!(state.levels["2"].goals["1"].goal_goal, Some(200.0));
    }
}
