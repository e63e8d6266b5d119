//! CLI smoke entry point.
//!
//! # Responsibility
//! - Wire an engine through link-time configurators and run one unit of work
//!   against an in-memory store.
//! - Keep output deterministic apart from generated ids.

use log::info;
use repokit_core::{
    configure_engine, default_log_level, init_logging, register_sql_repository, Configurator,
    ConfiguratorEntry, ContextOptions, Engine, EngineContext, Entity, EntityDescriptor,
    EntityKey, LinkedTypeFinder, Migration, Record, RepoError, RepoResult, ServiceCollection,
    ServiceEngine, SqliteDataContext, UnitOfWork, Value, CONFIGURATORS,
};
use std::error::Error;
use std::sync::Arc;
use uuid::Uuid;

const LOG_DIR_ENV: &str = "REPOKIT_LOG_DIR";

const SCHEMA: &[Migration] = &[Migration::new(
    1,
    "CREATE TABLE notes (id TEXT PRIMARY KEY, body TEXT NOT NULL);",
)];

static NOTES: EntityDescriptor = EntityDescriptor {
    table: "notes",
    key_columns: &["id"],
    columns: &["id", "body"],
};

#[derive(Debug, Clone, Default)]
struct Note {
    id: String,
    body: String,
}

impl Note {
    fn new(body: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
        }
    }
}

impl Entity for Note {
    fn descriptor() -> &'static EntityDescriptor {
        &NOTES
    }

    fn key(&self) -> EntityKey {
        self.id.as_str().into()
    }

    fn to_values(&self) -> Vec<Value> {
        vec![Value::Text(self.id.clone()), Value::Text(self.body.clone())]
    }

    fn from_record(record: &Record) -> RepoResult<Self> {
        Ok(Self {
            id: record.get("id")?,
            body: record.get("body")?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.body.trim().is_empty() {
            return Err("body must not be empty".to_string());
        }
        Ok(())
    }
}

struct NotesConfigurator;

impl Configurator for NotesConfigurator {
    fn name(&self) -> &'static str {
        "notes"
    }

    fn register(&self, services: &mut ServiceCollection, _environment: &str) {
        register_sql_repository::<Note>(services);
    }
}

#[linkme::distributed_slice(CONFIGURATORS)]
static NOTES_CONFIGURATOR: ConfiguratorEntry = ConfiguratorEntry {
    name: "notes",
    create: notes_configurator,
};

fn notes_configurator() -> Box<dyn Configurator> {
    Box::new(NotesConfigurator)
}

fn main() {
    if let Err(err) = run() {
        eprintln!("repokit error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    if let Ok(log_dir) = std::env::var(LOG_DIR_ENV) {
        init_logging(default_log_level(), &log_dir)?;
    }

    let engine: Arc<dyn Engine> = Arc::new(ServiceEngine::new());
    configure_engine(engine.as_ref(), ServiceCollection::new(), &LinkedTypeFinder, "")?;
    EngineContext::replace(Arc::clone(&engine));

    let context = SqliteDataContext::open_in_memory(&ContextOptions::default(), SCHEMA)?
        .into_shared();
    let mut uow = UnitOfWork::new(context);
    uow.begin_transaction()?;

    let notes = uow.repository_for::<Note>()?;
    notes.add_range(vec![Note::new("first"), Note::new("second")])?;
    let committed = uow.commit()?;

    let stored = notes.get_all_read_only(&[])?;
    if stored.len() != committed {
        return Err(Box::new(RepoError::InvalidData(format!(
            "committed {committed} notes but found {}",
            stored.len()
        ))));
    }
    info!(
        "event=cli_smoke module=cli status=ok uow_id={} committed={}",
        uow.id(),
        committed
    );

    println!("repokit_core version={}", repokit_core::core_version());
    println!(
        "repokit_core environment={}",
        engine.environment().unwrap_or_default()
    );
    println!("repokit_core committed={committed}");
    Ok(())
}
