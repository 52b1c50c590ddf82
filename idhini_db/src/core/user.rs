use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub roles: BTreeSet<String>,
    pub active: bool,
}

impl User {
    pub fn new(user_id: &str) -> Self {
        User {
            user_id: user_id.to_owned(),
            roles: BTreeSet::new(),
            active: true,
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.add_role(role);
        self
    }

    pub fn add_role(&mut self, role: &str) {
        self.roles.insert(role.to_string());
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Identity lookups the workflow needs from whoever owns user accounts.
/// A lookup that cannot be answered is an error, never a `false`.
pub trait IdentityResolver: Send + Sync {
    fn user_exists(&self, user_id: &str) -> Result<bool, StorageError>;
    fn user_is_active(&self, user_id: &str) -> Result<bool, StorageError>;
}

#[derive(Debug, Default, Clone)]
pub struct UserDirectory {
    users: HashMap<String, User>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the user with the same id.
    pub fn register(&mut self, user: User) -> Option<User> {
        self.users.insert(user.user_id.clone(), user)
    }

    pub fn get(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// All users sorted by id.
    pub fn all_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }
}

impl IdentityResolver for UserDirectory {
    fn user_exists(&self, user_id: &str) -> Result<bool, StorageError> {
        Ok(self.users.contains_key(user_id))
    }

    fn user_is_active(&self, user_id: &str) -> Result<bool, StorageError> {
        Ok(self.users.get(user_id).is_some_and(|u| u.active))
    }
}
