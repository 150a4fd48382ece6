use chrono::{Local, NaiveDate};
use clap::{Args, Subcommand};
use std::error::Error;

use repfit_core::{
    CustomMeal, CustomProduct, Entity, EntityFilter, EntityKind, FoodEntry, LocalStore, MealType,
    Operation, OperationQueue, StoredEntity,
};

use super::{confirm, find, truncate, OutputFormat};

#[derive(Args)]
pub struct FoodCommand {
    #[command(subcommand)]
    pub command: FoodSubcommand,
}

#[derive(Subcommand)]
pub enum FoodSubcommand {
    /// Log a food entry
    Log {
        /// Food name (defaults to the product's name with --product)
        name: Option<String>,

        /// Amount eaten in grams
        #[arg(long)]
        grams: f64,

        /// Total calories (computed from the product with --product)
        #[arg(long)]
        calories: Option<f64>,

        /// Meal type (breakfast, lunch, dinner, snack)
        #[arg(long, short, default_value = "snack")]
        meal_type: MealType,

        /// Date (YYYY-MM-DD, defaults to today)
        #[arg(long, short)]
        date: Option<NaiveDate>,

        /// Custom product ID to log from
        #[arg(long)]
        product: Option<String>,

        /// Custom meal ID this entry belongs to
        #[arg(long)]
        meal: Option<String>,

        /// Protein in grams
        #[arg(long)]
        protein: Option<f64>,

        /// Carbohydrates in grams
        #[arg(long)]
        carbs: Option<f64>,

        /// Fat in grams
        #[arg(long)]
        fat: Option<f64>,
    },

    /// Delete a food entry
    Delete {
        /// Food entry ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// List food entries for a day
    List {
        /// Date (YYYY-MM-DD, defaults to today)
        #[arg(long, short)]
        date: Option<NaiveDate>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Args)]
pub struct ProductCommand {
    #[command(subcommand)]
    pub command: ProductSubcommand,
}

#[derive(Subcommand)]
pub enum ProductSubcommand {
    /// Add a custom product
    Add {
        /// Product name
        name: String,

        /// Calories per 100 g
        #[arg(long)]
        calories: f64,

        /// Brand
        #[arg(long)]
        brand: Option<String>,

        /// Protein per 100 g
        #[arg(long, requires_all = ["carbs", "fat"])]
        protein: Option<f64>,

        /// Carbohydrates per 100 g
        #[arg(long, requires_all = ["protein", "fat"])]
        carbs: Option<f64>,

        /// Fat per 100 g
        #[arg(long, requires_all = ["protein", "carbs"])]
        fat: Option<f64>,
    },
}

#[derive(Args)]
pub struct MealCommand {
    #[command(subcommand)]
    pub command: MealSubcommand,
}

#[derive(Subcommand)]
pub enum MealSubcommand {
    /// Add a custom meal
    Add {
        /// Meal name
        name: String,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

async fn find_entry(store: &LocalStore, id: &str) -> Result<FoodEntry, Box<dyn Error>> {
    match find(store, EntityKind::FoodEntry, id).await? {
        Some(StoredEntity {
            entity: Entity::FoodEntry(entry),
            ..
        }) => Ok(entry),
        _ => Err(format!("Food entry not found: {}", id).into()),
    }
}

async fn entries_on(store: &LocalStore, date: NaiveDate) -> Result<Vec<FoodEntry>, Box<dyn Error>> {
    let rows = store.query(&EntityFilter::kind(EntityKind::FoodEntry)).await?;
    Ok(rows
        .into_iter()
        .filter_map(|stored| match stored.entity {
            Entity::FoodEntry(entry) if entry.date == date => Some(entry),
            _ => None,
        })
        .collect())
}

impl FoodCommand {
    pub async fn run(&self, queue: &OperationQueue) -> Result<(), Box<dyn Error>> {
        let store = queue.store();

        match &self.command {
            FoodSubcommand::Log {
                name,
                grams,
                calories,
                meal_type,
                date,
                product,
                meal,
                protein,
                carbs,
                fat,
            } => {
                if *grams <= 0.0 {
                    return Err("Grams must be a positive number".into());
                }
                let date = date.unwrap_or_else(today);

                let mut entry = match product {
                    Some(product_id) => {
                        let product = match find(store, EntityKind::CustomProduct, product_id).await? {
                            Some(StoredEntity {
                                entity: Entity::CustomProduct(product),
                                ..
                            }) => product,
                            _ => return Err(format!("Product not found: {}", product_id).into()),
                        };
                        let mut entry = FoodEntry::from_product(date, *meal_type, &product, *grams);
                        if let Some(name) = name {
                            entry.name = name.trim().to_string();
                        }
                        if let Some(calories) = calories {
                            entry.calories = *calories;
                        }
                        entry
                    }
                    None => {
                        let name = name
                            .as_deref()
                            .map(str::trim)
                            .filter(|n| !n.is_empty())
                            .ok_or("Food name is required without --product")?;
                        let calories = calories.ok_or("--calories is required without --product")?;
                        FoodEntry::new(date, *meal_type, name, *grams, calories)
                    }
                };

                if protein.is_some() {
                    entry.protein_g = *protein;
                }
                if carbs.is_some() {
                    entry.carbs_g = *carbs;
                }
                if fat.is_some() {
                    entry.fat_g = *fat;
                }
                if let Some(meal_id) = meal {
                    let meal = match find(store, EntityKind::CustomMeal, meal_id).await? {
                        Some(StoredEntity {
                            entity: Entity::CustomMeal(meal),
                            ..
                        }) => meal,
                        _ => return Err(format!("Meal not found: {}", meal_id).into()),
                    };
                    entry = entry.with_meal_id(meal.id);
                }

                let summary = format!(
                    "{} {}g ({:.0} kcal) for {} on {}",
                    entry.name, entry.grams, entry.calories, entry.meal_type, entry.date
                );
                let queued = queue.record(Operation::create(entry)).await?;
                println!("Logged {} ({})", summary, queued.entity_id);
                Ok(())
            }

            FoodSubcommand::Delete { id, force } => {
                let entry = find_entry(store, id).await?;

                if !force && !confirm(&format!("Delete '{}' from {}?", entry.name, entry.date))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }

                queue
                    .record(Operation::delete(EntityKind::FoodEntry, &entry.id))
                    .await?;
                println!("Deleted food entry: {}", entry.name);
                Ok(())
            }

            FoodSubcommand::List { date, format } => {
                let date = date.unwrap_or_else(today);
                let entries = entries_on(store, date).await?;

                if entries.is_empty() {
                    println!("No food logged on {}", date);
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&entries)?);
                    }
                    OutputFormat::Text => {
                        println!(
                            "{:<38}  {:<10}  {:<24}  {:>7}  {:>7}",
                            "ID", "MEAL", "NAME", "GRAMS", "KCAL"
                        );
                        println!("{}", "-".repeat(94));
                        for entry in &entries {
                            println!(
                                "{:<38}  {:<10}  {:<24}  {:>7.0}  {:>7.0}",
                                entry.id,
                                entry.meal_type.to_string(),
                                truncate(&entry.name, 24),
                                entry.grams,
                                entry.calories
                            );
                        }
                        let total: f64 = entries.iter().map(|e| e.calories).sum();
                        println!("\nTotal: {:.0} kcal in {} entr(ies)", total, entries.len());
                    }
                }
                Ok(())
            }
        }
    }
}

impl ProductCommand {
    pub async fn run(&self, queue: &OperationQueue) -> Result<(), Box<dyn Error>> {
        match &self.command {
            ProductSubcommand::Add {
                name,
                calories,
                brand,
                protein,
                carbs,
                fat,
            } => {
                if name.trim().is_empty() {
                    return Err("Product name cannot be empty".into());
                }
                if *calories < 0.0 {
                    return Err("Calories cannot be negative".into());
                }

                let mut product = CustomProduct::new(name.trim(), *calories);
                if let Some(brand) = brand {
                    product = product.with_brand(brand);
                }
                if let (Some(p), Some(c), Some(f)) = (protein, carbs, fat) {
                    product = product.with_macros(*p, *c, *f);
                }

                let queued = queue.record(Operation::create(product)).await?;
                println!("Added product: {} ({})", name.trim(), queued.entity_id);
                Ok(())
            }
        }
    }
}

impl MealCommand {
    pub async fn run(&self, queue: &OperationQueue) -> Result<(), Box<dyn Error>> {
        match &self.command {
            MealSubcommand::Add { name, notes } => {
                if name.trim().is_empty() {
                    return Err("Meal name cannot be empty".into());
                }

                let mut meal = CustomMeal::new(name.trim());
                if let Some(notes) = notes {
                    meal = meal.with_notes(notes);
                }

                let queued = queue.record(Operation::create(meal)).await?;
                println!("Added meal: {} ({})", name.trim(), queued.entity_id);
                Ok(())
            }
        }
    }
}
