use anyhow::{Context, Result};
use idhini_db::AuditLogEntry;

use crate::database_manager::DatabaseManager;

pub fn print_entry(entry: &AuditLogEntry) {
    println!(
        "#{:<5} {:<8} {:<22} by {:<12} at {}",
        entry.log_id,
        entry.action.as_str(),
        entry.subject.to_string(),
        entry.actor_id,
        entry.timestamp
    );

    if let Some(notes) = &entry.notes {
        println!("       notes: {}", notes);
    }
}

pub fn list(manager: &DatabaseManager) -> Result<()> {
    let entries = manager.service().audit_all()?;

    if entries.is_empty() {
        println!("Audit log is empty");
    }

    for entry in &entries {
        print_entry(entry);
    }

    Ok(())
}

pub fn verify(manager: &DatabaseManager) -> Result<()> {
    manager
        .service()
        .verify_audit()
        .context("Audit verification failed")?;

    let count = manager.service().audit_all()?.len();
    println!(
        "Audit trail intact: {} entries in {}",
        count,
        manager.db_path().display()
    );
    Ok(())
}
