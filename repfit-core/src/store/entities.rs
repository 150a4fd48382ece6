//! Per-table SQL for the entity rows.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection};

use super::StoredEntity;
use crate::models::{
    CustomMeal, CustomProduct, Entity, EntityKind, FoodEntry, Routine, RoutineExercise, Session,
    WorkoutSet,
};

/// Insert or replace an entity row, marking it pending.
pub(crate) async fn upsert(conn: &mut SqliteConnection, entity: &Entity) -> Result<(), sqlx::Error> {
    match entity {
        Entity::Routine(e) => {
            sqlx::query(
                r#"
                INSERT INTO routines (id, title, notes, updated_at, synced, deleted)
                VALUES (?, ?, ?, ?, 0, 0)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title, notes = excluded.notes,
                    updated_at = excluded.updated_at, synced = 0, deleted = 0
                "#,
            )
            .bind(&e.id)
            .bind(&e.title)
            .bind(&e.notes)
            .bind(e.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        Entity::RoutineExercise(e) => {
            sqlx::query(
                r#"
                INSERT INTO routine_exercises (id, routine_id, name, position, rest_secs, updated_at, synced, deleted)
                VALUES (?, ?, ?, ?, ?, ?, 0, 0)
                ON CONFLICT(id) DO UPDATE SET
                    routine_id = excluded.routine_id, name = excluded.name,
                    position = excluded.position, rest_secs = excluded.rest_secs,
                    updated_at = excluded.updated_at, synced = 0, deleted = 0
                "#,
            )
            .bind(&e.id)
            .bind(&e.routine_id)
            .bind(&e.name)
            .bind(e.position)
            .bind(e.rest_secs)
            .bind(e.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        Entity::WorkoutSet(e) => {
            sqlx::query(
                r#"
                INSERT INTO workout_sets (id, routine_exercise_id, position, reps, weight_kg, updated_at, synced, deleted)
                VALUES (?, ?, ?, ?, ?, ?, 0, 0)
                ON CONFLICT(id) DO UPDATE SET
                    routine_exercise_id = excluded.routine_exercise_id, position = excluded.position,
                    reps = excluded.reps, weight_kg = excluded.weight_kg,
                    updated_at = excluded.updated_at, synced = 0, deleted = 0
                "#,
            )
            .bind(&e.id)
            .bind(&e.routine_exercise_id)
            .bind(e.position)
            .bind(e.reps)
            .bind(e.weight_kg)
            .bind(e.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        Entity::Session(e) => {
            sqlx::query(
                r#"
                INSERT INTO sessions (id, routine_id, started_at, finished_at, notes, updated_at, synced, deleted)
                VALUES (?, ?, ?, ?, ?, ?, 0, 0)
                ON CONFLICT(id) DO UPDATE SET
                    routine_id = excluded.routine_id, started_at = excluded.started_at,
                    finished_at = excluded.finished_at, notes = excluded.notes,
                    updated_at = excluded.updated_at, synced = 0, deleted = 0
                "#,
            )
            .bind(&e.id)
            .bind(&e.routine_id)
            .bind(e.started_at)
            .bind(e.finished_at)
            .bind(&e.notes)
            .bind(e.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        Entity::FoodEntry(e) => {
            sqlx::query(
                r#"
                INSERT INTO food_entries (id, date, meal_type, name, grams, calories, protein_g, carbs_g, fat_g, product_id, meal_id, updated_at, synced, deleted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0)
                ON CONFLICT(id) DO UPDATE SET
                    date = excluded.date, meal_type = excluded.meal_type, name = excluded.name,
                    grams = excluded.grams, calories = excluded.calories,
                    protein_g = excluded.protein_g, carbs_g = excluded.carbs_g, fat_g = excluded.fat_g,
                    product_id = excluded.product_id, meal_id = excluded.meal_id,
                    updated_at = excluded.updated_at, synced = 0, deleted = 0
                "#,
            )
            .bind(&e.id)
            .bind(e.date)
            .bind(e.meal_type)
            .bind(&e.name)
            .bind(e.grams)
            .bind(e.calories)
            .bind(e.protein_g)
            .bind(e.carbs_g)
            .bind(e.fat_g)
            .bind(&e.product_id)
            .bind(&e.meal_id)
            .bind(e.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        Entity::CustomProduct(e) => {
            sqlx::query(
                r#"
                INSERT INTO custom_products (id, name, brand, calories_per_100g, protein_per_100g, carbs_per_100g, fat_per_100g, updated_at, synced, deleted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, brand = excluded.brand,
                    calories_per_100g = excluded.calories_per_100g,
                    protein_per_100g = excluded.protein_per_100g,
                    carbs_per_100g = excluded.carbs_per_100g,
                    fat_per_100g = excluded.fat_per_100g,
                    updated_at = excluded.updated_at, synced = 0, deleted = 0
                "#,
            )
            .bind(&e.id)
            .bind(&e.name)
            .bind(&e.brand)
            .bind(e.calories_per_100g)
            .bind(e.protein_per_100g)
            .bind(e.carbs_per_100g)
            .bind(e.fat_per_100g)
            .bind(e.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        Entity::CustomMeal(e) => {
            sqlx::query(
                r#"
                INSERT INTO custom_meals (id, name, notes, updated_at, synced, deleted)
                VALUES (?, ?, ?, ?, 0, 0)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, notes = excluded.notes,
                    updated_at = excluded.updated_at, synced = 0, deleted = 0
                "#,
            )
            .bind(&e.id)
            .bind(&e.name)
            .bind(&e.notes)
            .bind(e.updated_at)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Flag a row deleted and pending. Returns false if no such row exists.
pub(crate) async fn soft_delete(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET deleted = 1, synced = 0, updated_at = ? WHERE id = ?",
        kind.table()
    );
    let result = sqlx::query(&sql)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Set `synced = 1` unless another queued operation still targets the row.
pub(crate) async fn mark_synced(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET synced = 1 WHERE id = ?1 \
         AND NOT EXISTS (SELECT 1 FROM sync_queue WHERE entity_id = ?1)",
        kind.table()
    );
    let result = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

/// Replace `old` with `new` in every id and reference column of every table.
pub(crate) async fn rewrite_references(
    conn: &mut SqliteConnection,
    old: &str,
    new: &str,
) -> Result<u64, sqlx::Error> {
    let mut changed = 0;
    for kind in EntityKind::ALL {
        let sql = format!("UPDATE OR REPLACE {} SET id = ? WHERE id = ?", kind.table());
        changed += sqlx::query(&sql)
            .bind(new)
            .bind(old)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        for column in kind.reference_columns() {
            let sql = format!(
                "UPDATE {} SET {col} = ? WHERE {col} = ?",
                kind.table(),
                col = column
            );
            changed += sqlx::query(&sql)
                .bind(new)
                .bind(old)
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }
    }
    Ok(changed)
}

pub(crate) fn decode(kind: EntityKind, row: &SqliteRow) -> Result<StoredEntity, sqlx::Error> {
    let entity = match kind {
        EntityKind::Routine => Entity::Routine(Routine::from_row(row)?),
        EntityKind::RoutineExercise => Entity::RoutineExercise(RoutineExercise::from_row(row)?),
        EntityKind::WorkoutSet => Entity::WorkoutSet(WorkoutSet::from_row(row)?),
        EntityKind::Session => Entity::Session(Session::from_row(row)?),
        EntityKind::FoodEntry => Entity::FoodEntry(FoodEntry::from_row(row)?),
        EntityKind::CustomProduct => Entity::CustomProduct(CustomProduct::from_row(row)?),
        EntityKind::CustomMeal => Entity::CustomMeal(CustomMeal::from_row(row)?),
    };

    Ok(StoredEntity {
        entity,
        synced: row.try_get("synced")?,
        deleted: row.try_get("deleted")?,
    })
}
