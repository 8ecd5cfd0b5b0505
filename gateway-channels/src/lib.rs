pub mod attestation;
pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod exchange;
pub mod insights;
pub mod logger;
pub mod manager;
pub mod payment;
pub mod schema;
pub mod transport;
pub mod types;
pub mod wallet;

use diesel::PgConnection;
use diesel_migrations::embed_migrations;
use diesel_migrations::EmbeddedMigrations;
use diesel_migrations::MigrationHarness;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub fn run_migration(conn: &mut PgConnection) {
    conn.run_pending_migrations(MIGRATIONS)
        .expect("migrations to succeed");
}
