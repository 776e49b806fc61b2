pub mod loader;
pub mod model;

pub use loader::{APP_ID_FILE, ConfigLoader, apply_env, resolve_application_id};
pub use model::{AppConfig, DatabaseConfig, MigrationsConfig};
