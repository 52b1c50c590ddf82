use anyhow::{Context, Result, bail};
use idhini_db::User;

use crate::database_manager::DatabaseManager;

pub fn add(manager: &DatabaseManager, user_id: &str, roles: &[String]) -> Result<()> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        bail!("User id cannot be empty");
    }

    if manager.db().user(user_id)?.is_some() {
        bail!("User '{}' already exists", user_id);
    }

    let mut user = User::new(user_id);
    for role in roles {
        user.add_role(role);
    }

    manager
        .db()
        .register_user(user)
        .context("Failed to write user to WAL")?;

    println!("User '{}' registered", user_id);
    Ok(())
}

pub fn deactivate(manager: &DatabaseManager, user_id: &str) -> Result<()> {
    if !manager
        .db()
        .deactivate_user(user_id)
        .context("Failed to write user to WAL")?
    {
        bail!("User '{}' not found", user_id);
    }

    println!("User '{}' deactivated", user_id);
    Ok(())
}

pub fn list(manager: &DatabaseManager) -> Result<()> {
    let users = manager.db().users()?;

    if users.is_empty() {
        println!("No users registered");
        return Ok(());
    }

    for user in users {
        let roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
        println!(
            "{:<16} {:<9} {}",
            user.user_id,
            if user.active { "active" } else { "inactive" },
            roles.join(",")
        );
    }

    Ok(())
}
