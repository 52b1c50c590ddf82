use anyhow::{Context, Result};
use idhini_db::Database;

use crate::config::Config;

pub fn run(config: &Config) -> Result<()> {
    println!("Initialising Idhini database...\n");

    if config.db_path.exists() {
        anyhow::bail!("Database already exists at: {}", config.db_path.display())
    }

    let idhini_dir = Config::idhini_dir()?;
    std::fs::create_dir_all(&idhini_dir).context("Failed to create .idhini directory")?;
    println!("Created: {}", idhini_dir.display());

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    println!("Writing empty snapshot to: {}", config.db_path.display());

    let db = Database::open(&config.db_path).context("Failed to create database")?;
    db.compact().context("Failed to write initial snapshot")?;

    if !Config::config_file()?.exists() {
        config.save()?;
        println!("Saved config: {}", Config::config_file()?.display());
    }

    println!("Register users with: idhini user add <user_id>");
    println!("Initialisation complete!");

    Ok(())
}
