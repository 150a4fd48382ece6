//! The closed set of synchronisable entities.
//!
//! [`EntityKind`] names a table and a remote collection; [`Entity`] carries a
//! typed row of that kind. The sync engine only ever looks at an entity's own
//! id and the ids it references, both exposed here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::nutrition::{CustomMeal, CustomProduct, FoodEntry};
use super::workout::{Routine, RoutineExercise, Session, WorkoutSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Routine,
    RoutineExercise,
    WorkoutSet,
    Session,
    FoodEntry,
    CustomProduct,
    CustomMeal,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Routine,
        EntityKind::RoutineExercise,
        EntityKind::WorkoutSet,
        EntityKind::Session,
        EntityKind::FoodEntry,
        EntityKind::CustomProduct,
        EntityKind::CustomMeal,
    ];

    /// Name stored in the queue's `entity_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Routine => "routine",
            EntityKind::RoutineExercise => "routine_exercise",
            EntityKind::WorkoutSet => "workout_set",
            EntityKind::Session => "session",
            EntityKind::FoodEntry => "food_entry",
            EntityKind::CustomProduct => "custom_product",
            EntityKind::CustomMeal => "custom_meal",
        }
    }

    /// Local SQLite table.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Routine => "routines",
            EntityKind::RoutineExercise => "routine_exercises",
            EntityKind::WorkoutSet => "workout_sets",
            EntityKind::Session => "sessions",
            EntityKind::FoodEntry => "food_entries",
            EntityKind::CustomProduct => "custom_products",
            EntityKind::CustomMeal => "custom_meals",
        }
    }

    /// Remote collection path segment.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Routine => "routines",
            EntityKind::RoutineExercise => "routine-exercises",
            EntityKind::WorkoutSet => "sets",
            EntityKind::Session => "sessions",
            EntityKind::FoodEntry => "food-entries",
            EntityKind::CustomProduct => "custom-products",
            EntityKind::CustomMeal => "custom-meals",
        }
    }

    /// Columns holding ids of other entities.
    pub fn reference_columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::RoutineExercise => &["routine_id"],
            EntityKind::WorkoutSet => &["routine_exercise_id"],
            EntityKind::Session => &["routine_id"],
            EntityKind::FoodEntry => &["product_id", "meal_id"],
            EntityKind::Routine | EntityKind::CustomProduct | EntityKind::CustomMeal => &[],
        }
    }

    /// Parse a remote collection name back into a kind.
    pub fn from_collection(collection: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.collection() == collection)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown entity type '{}'", s))
    }
}

/// A typed entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Entity {
    Routine(Routine),
    RoutineExercise(RoutineExercise),
    WorkoutSet(WorkoutSet),
    Session(Session),
    FoodEntry(FoodEntry),
    CustomProduct(CustomProduct),
    CustomMeal(CustomMeal),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Routine(_) => EntityKind::Routine,
            Entity::RoutineExercise(_) => EntityKind::RoutineExercise,
            Entity::WorkoutSet(_) => EntityKind::WorkoutSet,
            Entity::Session(_) => EntityKind::Session,
            Entity::FoodEntry(_) => EntityKind::FoodEntry,
            Entity::CustomProduct(_) => EntityKind::CustomProduct,
            Entity::CustomMeal(_) => EntityKind::CustomMeal,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Routine(e) => &e.id,
            Entity::RoutineExercise(e) => &e.id,
            Entity::WorkoutSet(e) => &e.id,
            Entity::Session(e) => &e.id,
            Entity::FoodEntry(e) => &e.id,
            Entity::CustomProduct(e) => &e.id,
            Entity::CustomMeal(e) => &e.id,
        }
    }

    fn id_mut(&mut self) -> &mut String {
        match self {
            Entity::Routine(e) => &mut e.id,
            Entity::RoutineExercise(e) => &mut e.id,
            Entity::WorkoutSet(e) => &mut e.id,
            Entity::Session(e) => &mut e.id,
            Entity::FoodEntry(e) => &mut e.id,
            Entity::CustomProduct(e) => &mut e.id,
            Entity::CustomMeal(e) => &mut e.id,
        }
    }

    /// Ids of other entities this one points at.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Entity::RoutineExercise(e) => vec![e.routine_id.as_str()],
            Entity::WorkoutSet(e) => vec![e.routine_exercise_id.as_str()],
            Entity::Session(e) => e.routine_id.as_deref().into_iter().collect(),
            Entity::FoodEntry(e) => e
                .product_id
                .as_deref()
                .into_iter()
                .chain(e.meal_id.as_deref())
                .collect(),
            Entity::Routine(_) | Entity::CustomProduct(_) | Entity::CustomMeal(_) => Vec::new(),
        }
    }

    /// Replace every occurrence of `old` (own id or reference) with `new`.
    ///
    /// Returns true if anything changed.
    pub fn rewrite_id(&mut self, old: &str, new: &str) -> bool {
        let mut changed = swap(self.id_mut(), old, new);
        changed |= match self {
            Entity::RoutineExercise(e) => swap(&mut e.routine_id, old, new),
            Entity::WorkoutSet(e) => swap(&mut e.routine_exercise_id, old, new),
            Entity::Session(e) => swap_opt(&mut e.routine_id, old, new),
            Entity::FoodEntry(e) => {
                // Both must run; `|` does not short-circuit.
                swap_opt(&mut e.product_id, old, new) | swap_opt(&mut e.meal_id, old, new)
            }
            Entity::Routine(_) | Entity::CustomProduct(_) | Entity::CustomMeal(_) => false,
        };
        changed
    }

    /// The JSON body sent to the server (untagged entity fields).
    pub fn to_body(&self) -> serde_json::Value {
        let value = match self {
            Entity::Routine(e) => serde_json::to_value(e),
            Entity::RoutineExercise(e) => serde_json::to_value(e),
            Entity::WorkoutSet(e) => serde_json::to_value(e),
            Entity::Session(e) => serde_json::to_value(e),
            Entity::FoodEntry(e) => serde_json::to_value(e),
            Entity::CustomProduct(e) => serde_json::to_value(e),
            Entity::CustomMeal(e) => serde_json::to_value(e),
        };
        // Plain structs of strings, numbers and dates always serialize.
        value.unwrap_or(serde_json::Value::Null)
    }
}

fn swap(slot: &mut String, old: &str, new: &str) -> bool {
    if slot == old {
        *slot = new.to_string();
        true
    } else {
        false
    }
}

fn swap_opt(slot: &mut Option<String>, old: &str, new: &str) -> bool {
    match slot {
        Some(value) => swap(value, old, new),
        None => false,
    }
}

macro_rules! impl_from_model {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Entity {
                fn from(value: $variant) -> Self {
                    Entity::$variant(value)
                }
            }
        )*
    };
}

impl_from_model!(
    Routine,
    RoutineExercise,
    WorkoutSet,
    Session,
    FoodEntry,
    CustomProduct,
    CustomMeal
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MealType;
    use chrono::NaiveDate;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
            assert_eq!(EntityKind::from_collection(kind.collection()), Some(kind));
        }
        assert!("workout".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_references_for_food_entry() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let entry = FoodEntry::new(date, MealType::Lunch, "Rice", 200.0, 260.0)
            .with_meal_id("local_meal");
        let entity = Entity::from(entry);
        assert_eq!(entity.references(), vec!["local_meal"]);
    }

    #[test]
    fn test_rewrite_id_touches_own_id_and_references() {
        let mut exercise = Entity::from(RoutineExercise::new("local_r", "Squat"));
        let own = exercise.id().to_string();

        assert!(exercise.rewrite_id("local_r", "srv-1"));
        assert_eq!(exercise.references(), vec!["srv-1"]);

        assert!(exercise.rewrite_id(&own, "srv-2"));
        assert_eq!(exercise.id(), "srv-2");

        assert!(!exercise.rewrite_id("local_unknown", "srv-3"));
    }

    #[test]
    fn test_rewrite_id_updates_both_food_references() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let mut entry = FoodEntry::new(date, MealType::Lunch, "Rice", 200.0, 260.0);
        entry.product_id = Some("local_x".to_string());
        entry.meal_id = Some("local_x".to_string());
        let mut entity = Entity::from(entry);

        assert!(entity.rewrite_id("local_x", "srv"));
        assert_eq!(entity.references(), vec!["srv", "srv"]);
    }

    #[test]
    fn test_to_body_is_untagged() {
        let routine = Routine::new("Leg Day");
        let body = Entity::from(routine.clone()).to_body();
        assert_eq!(body["title"], "Leg Day");
        assert_eq!(body["id"], routine.id.as_str());
        assert!(body.get("type").is_none());
    }
}
