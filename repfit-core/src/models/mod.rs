mod entity;
mod meal_type;
mod nutrition;
mod workout;

pub use entity::{Entity, EntityKind};
pub use meal_type::MealType;
pub use nutrition::{CustomMeal, CustomProduct, FoodEntry};
pub use workout::{Routine, RoutineExercise, Session, WorkoutSet};
