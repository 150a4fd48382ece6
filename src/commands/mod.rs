mod config_cmd;
mod nutrition;
mod sync_cmd;
mod workout;

pub use config_cmd::ConfigCommand;
pub use nutrition::{FoodCommand, MealCommand, ProductCommand};
pub use sync_cmd::{SyncCommand, SyncCommandError};
pub use workout::{ExerciseCommand, RoutineCommand, SessionCommand, SetCommand};

use clap::ValueEnum;
use std::io::{self, Write};

use repfit_core::{is_temporary, EntityKind, IdMapper, LocalStore, StorageError, StoredEntity};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Look up a live row by id. A temporary id the server has since replaced
/// still finds the row under its new id.
pub(crate) async fn find(
    store: &LocalStore,
    kind: EntityKind,
    id: &str,
) -> Result<Option<StoredEntity>, StorageError> {
    let found = match store.get(kind, id).await? {
        Some(found) => Some(found),
        None if is_temporary(id) => match IdMapper::new(store.clone()).lookup(id).await? {
            Some(server_id) => store.get(kind, &server_id).await?,
            None => None,
        },
        None => None,
    };
    Ok(found.filter(|stored| !stored.deleted))
}

/// Ask a yes/no question on stdin. Anything but `y` is a no.
pub(crate) fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Shorten to `max` characters for table output.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text.to_string()
    }
}
