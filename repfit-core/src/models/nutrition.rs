use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::meal_type::MealType;
use crate::id::new_temp_id;

/// A logged food item for a given day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FoodEntry {
    pub id: String,
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub name: String,
    pub grams: f64,
    pub calories: f64,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    /// Custom product this entry was logged from, if any.
    pub product_id: Option<String>,
    /// Custom meal this entry belongs to, if any.
    pub meal_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FoodEntry {
    pub fn new(
        date: NaiveDate,
        meal_type: MealType,
        name: impl Into<String>,
        grams: f64,
        calories: f64,
    ) -> Self {
        Self {
            id: new_temp_id(),
            date,
            meal_type,
            name: name.into(),
            grams,
            calories,
            protein_g: None,
            carbs_g: None,
            fat_g: None,
            product_id: None,
            meal_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Build an entry from a custom product, scaling its per-100g values.
    pub fn from_product(
        date: NaiveDate,
        meal_type: MealType,
        product: &CustomProduct,
        grams: f64,
    ) -> Self {
        let scale = |per_100g: f64| per_100g * grams / 100.0;
        let mut entry = Self::new(
            date,
            meal_type,
            product.name.clone(),
            grams,
            scale(product.calories_per_100g),
        );
        entry.protein_g = product.protein_per_100g.map(scale);
        entry.carbs_g = product.carbs_per_100g.map(scale);
        entry.fat_g = product.fat_per_100g.map(scale);
        entry.product_id = Some(product.id.clone());
        entry
    }

    pub fn with_macros(mut self, protein_g: f64, carbs_g: f64, fat_g: f64) -> Self {
        self.protein_g = Some(protein_g);
        self.carbs_g = Some(carbs_g);
        self.fat_g = Some(fat_g);
        self
    }

    pub fn with_meal_id(mut self, meal_id: impl Into<String>) -> Self {
        self.meal_id = Some(meal_id.into());
        self
    }
}

/// A user-defined product with nutrition values per 100 g.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CustomProduct {
    pub id: String,
    pub name: String,
    pub brand: Option<String>,
    pub calories_per_100g: f64,
    pub protein_per_100g: Option<f64>,
    pub carbs_per_100g: Option<f64>,
    pub fat_per_100g: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl CustomProduct {
    pub fn new(name: impl Into<String>, calories_per_100g: f64) -> Self {
        Self {
            id: new_temp_id(),
            name: name.into(),
            brand: None,
            calories_per_100g,
            protein_per_100g: None,
            carbs_per_100g: None,
            fat_per_100g: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_macros(mut self, protein: f64, carbs: f64, fat: f64) -> Self {
        self.protein_per_100g = Some(protein);
        self.carbs_per_100g = Some(carbs);
        self.fat_per_100g = Some(fat);
        self
    }
}

/// A user-defined meal grouping several food entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CustomMeal {
    pub id: String,
    pub name: String,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CustomMeal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_temp_id(),
            name: name.into(),
            notes: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}
