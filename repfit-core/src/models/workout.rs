use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::new_temp_id;

/// A named training routine, e.g. "Leg Day".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Routine {
    pub id: String,
    pub title: String,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Routine {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: new_temp_id(),
            title: title.into(),
            notes: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// An exercise slot inside a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoutineExercise {
    pub id: String,
    pub routine_id: String,
    pub name: String,
    pub position: i64,
    pub rest_secs: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl RoutineExercise {
    pub fn new(routine_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_temp_id(),
            routine_id: routine_id.into(),
            name: name.into(),
            position: 0,
            rest_secs: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }

    pub fn with_rest_secs(mut self, rest_secs: i64) -> Self {
        self.rest_secs = Some(rest_secs);
        self
    }
}

/// A planned set for an exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkoutSet {
    pub id: String,
    pub routine_exercise_id: String,
    pub position: i64,
    pub reps: i64,
    pub weight_kg: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl WorkoutSet {
    pub fn new(routine_exercise_id: impl Into<String>, reps: i64) -> Self {
        Self {
            id: new_temp_id(),
            routine_exercise_id: routine_exercise_id.into(),
            position: 0,
            reps,
            weight_kg: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_weight_kg(mut self, weight_kg: f64) -> Self {
        self.weight_kg = Some(weight_kg);
        self
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }
}

/// A performed workout, optionally following a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub routine_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            id: new_temp_id(),
            routine_id: None,
            started_at: now,
            finished_at: None,
            notes: None,
            updated_at: now,
        }
    }

    pub fn with_routine_id(mut self, routine_id: impl Into<String>) -> Self {
        self.routine_id = Some(routine_id.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
