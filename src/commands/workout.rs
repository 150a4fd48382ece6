use clap::{Args, Subcommand};
use std::error::Error;

use repfit_core::{
    Entity, EntityFilter, EntityKind, LocalStore, Operation, OperationQueue, Routine,
    RoutineExercise, Session, StoredEntity, WorkoutSet,
};

use super::{confirm, find, truncate, OutputFormat};

#[derive(Args)]
pub struct RoutineCommand {
    #[command(subcommand)]
    pub command: RoutineSubcommand,
}

#[derive(Subcommand)]
pub enum RoutineSubcommand {
    /// Create a new routine
    Create {
        /// Routine title
        title: String,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Rename a routine
    Rename {
        /// Routine ID
        id: String,

        /// New title
        title: String,
    },

    /// Delete a routine
    Delete {
        /// Routine ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// List routines
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Args)]
pub struct ExerciseCommand {
    #[command(subcommand)]
    pub command: ExerciseSubcommand,
}

#[derive(Subcommand)]
pub enum ExerciseSubcommand {
    /// Add an exercise to a routine
    Add {
        /// Routine ID
        routine: String,

        /// Exercise name
        name: String,

        /// Rest between sets, in seconds
        #[arg(long)]
        rest_secs: Option<i64>,
    },
}

#[derive(Args)]
pub struct SetCommand {
    #[command(subcommand)]
    pub command: SetSubcommand,
}

#[derive(Subcommand)]
pub enum SetSubcommand {
    /// Add a set to a routine exercise
    Add {
        /// Routine exercise ID
        exercise: String,

        /// Repetitions
        reps: i64,

        /// Weight in kilograms
        #[arg(long)]
        weight_kg: Option<f64>,
    },
}

#[derive(Args)]
pub struct SessionCommand {
    #[command(subcommand)]
    pub command: SessionSubcommand,
}

#[derive(Subcommand)]
pub enum SessionSubcommand {
    /// Start a workout session
    Start {
        /// Routine being performed
        #[arg(long)]
        routine: Option<String>,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Finish a workout session
    Finish {
        /// Session ID
        id: String,
    },
}

async fn find_routine(store: &LocalStore, id: &str) -> Result<Routine, Box<dyn Error>> {
    match find(store, EntityKind::Routine, id).await? {
        Some(StoredEntity {
            entity: Entity::Routine(routine),
            ..
        }) => Ok(routine),
        _ => Err(format!("Routine not found: {}", id).into()),
    }
}

/// Live rows of `kind` whose references include `parent_id`.
async fn children(
    store: &LocalStore,
    kind: EntityKind,
    parent_id: &str,
) -> Result<Vec<Entity>, Box<dyn Error>> {
    let rows = store.query(&EntityFilter::kind(kind)).await?;
    Ok(rows
        .into_iter()
        .map(|stored| stored.entity)
        .filter(|entity| entity.references().contains(&parent_id))
        .collect())
}

fn sync_label(stored: &StoredEntity) -> &'static str {
    if stored.synced {
        "synced"
    } else {
        "pending"
    }
}

impl RoutineCommand {
    pub async fn run(&self, queue: &OperationQueue) -> Result<(), Box<dyn Error>> {
        let store = queue.store();

        match &self.command {
            RoutineSubcommand::Create { title, notes } => {
                if title.trim().is_empty() {
                    return Err("Routine title cannot be empty".into());
                }

                let mut routine = Routine::new(title.trim());
                if let Some(notes) = notes {
                    routine = routine.with_notes(notes);
                }

                let queued = queue.record(Operation::create(routine)).await?;
                println!("Created routine: {} ({})", title.trim(), queued.entity_id);
                Ok(())
            }

            RoutineSubcommand::Rename { id, title } => {
                if title.trim().is_empty() {
                    return Err("Routine title cannot be empty".into());
                }

                let mut routine = find_routine(store, id).await?;
                routine.title = title.trim().to_string();
                routine.updated_at = chrono::Utc::now();

                let queued = queue.record(Operation::update(routine)).await?;
                println!("Renamed routine {} to '{}'", queued.entity_id, title.trim());
                Ok(())
            }

            RoutineSubcommand::Delete { id, force } => {
                let routine = find_routine(store, id).await?;

                if !force && !confirm(&format!("Delete routine '{}'?", routine.title))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }

                queue
                    .record(Operation::delete(EntityKind::Routine, &routine.id))
                    .await?;
                println!("Deleted routine: {}", routine.title);
                Ok(())
            }

            RoutineSubcommand::List { format } => {
                let routines = store.query(&EntityFilter::kind(EntityKind::Routine)).await?;

                if routines.is_empty() {
                    println!("No routines found");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        let entities: Vec<&Entity> = routines.iter().map(|r| &r.entity).collect();
                        println!("{}", serde_json::to_string_pretty(&entities)?);
                    }
                    OutputFormat::Text => {
                        println!("{:<38}  {:<30}  {:>9}  STATUS", "ID", "TITLE", "EXERCISES");
                        println!("{}", "-".repeat(92));
                        for stored in &routines {
                            let Entity::Routine(routine) = &stored.entity else {
                                continue;
                            };
                            let exercises =
                                children(store, EntityKind::RoutineExercise, &routine.id).await?;
                            println!(
                                "{:<38}  {:<30}  {:>9}  {}",
                                routine.id,
                                truncate(&routine.title, 30),
                                exercises.len(),
                                sync_label(stored)
                            );
                        }
                        println!("\nTotal: {} routine(s)", routines.len());
                    }
                }
                Ok(())
            }
        }
    }
}

impl ExerciseCommand {
    pub async fn run(&self, queue: &OperationQueue) -> Result<(), Box<dyn Error>> {
        let store = queue.store();

        match &self.command {
            ExerciseSubcommand::Add {
                routine,
                name,
                rest_secs,
            } => {
                if name.trim().is_empty() {
                    return Err("Exercise name cannot be empty".into());
                }

                let routine = find_routine(store, routine).await?;
                let position = children(store, EntityKind::RoutineExercise, &routine.id)
                    .await?
                    .len();

                let mut exercise = RoutineExercise::new(&routine.id, name.trim())
                    .with_position(i64::try_from(position)?);
                if let Some(rest_secs) = rest_secs {
                    exercise = exercise.with_rest_secs(*rest_secs);
                }

                let queued = queue.record(Operation::create(exercise)).await?;
                println!(
                    "Added '{}' to '{}' ({})",
                    name.trim(),
                    routine.title,
                    queued.entity_id
                );
                Ok(())
            }
        }
    }
}

impl SetCommand {
    pub async fn run(&self, queue: &OperationQueue) -> Result<(), Box<dyn Error>> {
        let store = queue.store();

        match &self.command {
            SetSubcommand::Add {
                exercise,
                reps,
                weight_kg,
            } => {
                if *reps <= 0 {
                    return Err("Reps must be a positive number".into());
                }

                let exercise = match find(store, EntityKind::RoutineExercise, exercise).await? {
                    Some(StoredEntity {
                        entity: Entity::RoutineExercise(exercise),
                        ..
                    }) => exercise,
                    _ => return Err(format!("Exercise not found: {}", exercise).into()),
                };
                let position = children(store, EntityKind::WorkoutSet, &exercise.id)
                    .await?
                    .len();

                let mut set =
                    WorkoutSet::new(&exercise.id, *reps).with_position(i64::try_from(position)?);
                if let Some(weight_kg) = weight_kg {
                    set = set.with_weight_kg(*weight_kg);
                }

                let queued = queue.record(Operation::create(set)).await?;
                println!(
                    "Added set {} of {} x {} to '{}' ({})",
                    position + 1,
                    reps,
                    weight_kg
                        .map(|w| format!("{} kg", w))
                        .unwrap_or_else(|| "bodyweight".to_string()),
                    exercise.name,
                    queued.entity_id
                );
                Ok(())
            }
        }
    }
}

impl SessionCommand {
    pub async fn run(&self, queue: &OperationQueue) -> Result<(), Box<dyn Error>> {
        let store = queue.store();

        match &self.command {
            SessionSubcommand::Start { routine, notes } => {
                let mut session = Session::start();
                if let Some(routine) = routine {
                    let routine = find_routine(store, routine).await?;
                    session = session.with_routine_id(&routine.id);
                }
                if let Some(notes) = notes {
                    session = session.with_notes(notes);
                }

                let queued = queue.record(Operation::create(session)).await?;
                println!("Started session {}", queued.entity_id);
                Ok(())
            }

            SessionSubcommand::Finish { id } => {
                let mut session = match find(store, EntityKind::Session, id).await? {
                    Some(StoredEntity {
                        entity: Entity::Session(session),
                        ..
                    }) => session,
                    _ => return Err(format!("Session not found: {}", id).into()),
                };
                if session.is_finished() {
                    return Err(format!("Session {} is already finished", session.id).into());
                }

                session.finish();
                let minutes = session
                    .finished_at
                    .map(|end| (end - session.started_at).num_minutes())
                    .unwrap_or(0);

                let queued = queue.record(Operation::update(session)).await?;
                println!("Finished session {} ({} min)", queued.entity_id, minutes);
                Ok(())
            }
        }
    }
}
