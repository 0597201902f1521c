//! User account storage
//!
//! Manages a JSON file mapping user GUIDs to account records. All writes use
//! atomic temp-file + rename, and the in-memory map only changes once the
//! file has been written. A tokio Mutex serializes concurrent writers;
//! readers lock briefly and clone what they need.
//!
//! Password hashes are Argon2 PHC strings produced by `password-auth`. Hashing
//! runs on the blocking pool so it never stalls the async workers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};

const MAX_USERNAME_LEN: usize = 100;

/// Role carried by an identity and by the tokens issued for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn from_admin_flag(is_admin: bool) -> Self {
        if is_admin { Role::Admin } else { Role::User }
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }
}

/// The view of an account the auth core works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub guid: Uuid,
    pub username: String,
    pub role: Role,
}

/// The caller of a user-management operation.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub guid: Uuid,
    pub role: Role,
}

/// A stored user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub guid: Uuid,
    pub username: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub department: String,
    #[serde(rename = "isAdmin", default)]
    pub is_admin: bool,
    /// Argon2 PHC string, never the password itself
    pub password_hash: String,
}

impl UserRecord {
    pub fn role(&self) -> Role {
        Role::from_admin_flag(self.is_admin)
    }

    pub fn identity(&self) -> Identity {
        Identity {
            guid: self.guid,
            username: self.username.clone(),
            role: self.role(),
        }
    }
}

/// Account fields safe to return over the API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserView {
    pub guid: Uuid,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub department: String,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
}

impl From<&UserRecord> for UserView {
    fn from(record: &UserRecord) -> Self {
        Self {
            guid: record.guid,
            username: record.username.clone(),
            firstname: record.firstname.clone(),
            lastname: record.lastname.clone(),
            email: record.email.clone(),
            department: record.department.clone(),
            is_admin: record.is_admin,
        }
    }
}

/// Request body for account creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub department: String,
    #[serde(rename = "isAdmin", default)]
    pub is_admin: bool,
}

impl NewUser {
    pub fn validate(&self) -> Result<()> {
        validate_username(&self.username)?;
        if self.password.is_empty() {
            return Err(Error::Validation("password is required".into()));
        }
        validate_email(&self.email)
    }
}

/// Request body for account updates. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub password: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
    #[serde(rename = "isAdmin")]
    pub is_admin: Option<bool>,
}

impl UserUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(username) = &self.username {
            validate_username(username)?;
        }
        if matches!(&self.password, Some(p) if p.is_empty()) {
            return Err(Error::Validation("password must not be empty".into()));
        }
        if let Some(email) = &self.email {
            validate_email(email)?;
        }
        Ok(())
    }
}

fn validate_username(username: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(Error::Validation("username is required".into()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(Error::Validation(format!(
            "username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<()> {
    if !email.is_empty() && !email.contains('@') {
        return Err(Error::Validation(format!("invalid email address: {email}")));
    }
    Ok(())
}

/// Hash a password on the blocking pool.
pub async fn hash_password(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || password_auth::generate_hash(password))
        .await
        .map_err(|e| Error::Internal(format!("password hashing task failed: {e}")))
}

/// Thread-safe user file manager.
pub struct UserStore {
    path: PathBuf,
    state: Mutex<HashMap<Uuid, UserRecord>>,
}

impl UserStore {
    /// Load users from the given file path.
    ///
    /// A missing file is created as `{}`.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading user file: {e}")))?;
            let users: HashMap<Uuid, UserRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::StoreParse(format!("parsing user file: {e}")))?;
            info!(path = %path.display(), users = users.len(), "loaded users");
            users
        } else {
            info!(path = %path.display(), "user file not found, starting with empty store");
            let users = HashMap::new();
            write_atomic(&path, &users).await?;
            users
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Find an account by exact username.
    pub async fn find_by_username(&self, username: &str) -> Option<UserRecord> {
        let state = self.state.lock().await;
        state.values().find(|u| u.username == username).cloned()
    }

    /// Get an account by GUID.
    #[cfg(test)]
    pub(crate) async fn get(&self, guid: Uuid) -> Option<UserRecord> {
        let state = self.state.lock().await;
        state.get(&guid).cloned()
    }

    /// Accounts visible to `actor`: all of them for admins, only their own
    /// record otherwise. Sorted by username.
    pub async fn list(&self, actor: &Actor) -> Vec<UserView> {
        let state = self.state.lock().await;
        let mut users: Vec<UserView> = state
            .values()
            .filter(|u| actor.role.is_admin() || u.guid == actor.guid)
            .map(UserView::from)
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Create an account. Admin only.
    pub async fn create(&self, actor: &Actor, new_user: NewUser) -> Result<Uuid> {
        if !actor.role.is_admin() {
            return Err(Error::Forbidden("only admins can create users".into()));
        }
        new_user.validate()?;
        if self.find_by_username(&new_user.username).await.is_some() {
            return Err(Error::Conflict(new_user.username));
        }

        let password_hash = hash_password(new_user.password).await?;
        let record = UserRecord {
            guid: Uuid::new_v4(),
            username: new_user.username,
            firstname: new_user.firstname,
            lastname: new_user.lastname,
            email: new_user.email,
            department: new_user.department,
            is_admin: new_user.is_admin,
            password_hash,
        };
        self.insert_unique(record).await
    }

    /// Create the initial `admin` account when the store is empty.
    ///
    /// Returns `None` when accounts already exist.
    pub async fn bootstrap_admin(&self, password: &str) -> Result<Option<Uuid>> {
        if !self.is_empty().await {
            return Ok(None);
        }
        let password_hash = hash_password(password.to_owned()).await?;
        let record = UserRecord {
            guid: Uuid::new_v4(),
            username: "admin".into(),
            firstname: "Homer".into(),
            lastname: "Admin".into(),
            email: String::new(),
            department: String::new(),
            is_admin: true,
            password_hash,
        };
        let guid = self.insert_unique(record).await?;
        info!(%guid, "created bootstrap admin account");
        Ok(Some(guid))
    }

    async fn insert_unique(&self, record: UserRecord) -> Result<Uuid> {
        let mut state = self.state.lock().await;
        // Re-checked under the lock: hashing happened without it.
        if state.values().any(|u| u.username == record.username) {
            return Err(Error::Conflict(record.username));
        }
        let guid = record.guid;
        let mut next = state.clone();
        next.insert(guid, record);
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(%guid, "created user");
        Ok(guid)
    }

    /// Update an account.
    ///
    /// Admins may update anyone. Other users may only update themselves and
    /// may not change the admin flag.
    pub async fn update(&self, actor: &Actor, guid: Uuid, update: UserUpdate) -> Result<()> {
        let is_admin = actor.role.is_admin();
        if !is_admin && actor.guid != guid {
            return Err(Error::Forbidden("users may only update their own account".into()));
        }
        if !is_admin && update.is_admin.is_some() {
            return Err(Error::Forbidden("only admins can change the admin flag".into()));
        }
        update.validate()?;

        let password_hash = match update.password {
            Some(password) => Some(hash_password(password).await?),
            None => None,
        };

        let mut state = self.state.lock().await;
        if let Some(username) = &update.username {
            if state.values().any(|u| &u.username == username && u.guid != guid) {
                return Err(Error::Conflict(username.clone()));
            }
        }
        let mut record = state
            .get(&guid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {guid}")))?;

        if let Some(username) = update.username {
            record.username = username;
        }
        if let Some(firstname) = update.firstname {
            record.firstname = firstname;
        }
        if let Some(lastname) = update.lastname {
            record.lastname = lastname;
        }
        if let Some(email) = update.email {
            record.email = email;
        }
        if let Some(department) = update.department {
            record.department = department;
        }
        if let Some(flag) = update.is_admin {
            record.is_admin = flag;
        }
        if let Some(hash) = password_hash {
            record.password_hash = hash;
        }

        let mut next = state.clone();
        next.insert(guid, record);
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(%guid, "updated user");
        Ok(())
    }

    /// Delete an account. Admin only.
    pub async fn delete(&self, actor: &Actor, guid: Uuid) -> Result<()> {
        if !actor.role.is_admin() {
            return Err(Error::Forbidden("only admins can delete users".into()));
        }
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        if next.remove(&guid).is_none() {
            return Err(Error::NotFound(format!("user {guid}")));
        }
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(%guid, "deleted user");
        Ok(())
    }

    /// Number of stored accounts.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write users to a file atomically.
///
/// Writes a temp file in the same directory, then renames it over the target.
/// The file holds password hashes, so it is created 0600 on unix.
async fn write_atomic(path: &Path, data: &HashMap<Uuid, UserRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::StoreParse(format!("serializing users: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("user file path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".users.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp user file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting user file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp user file: {e}")))?;

    debug!(path = %path.display(), "persisted users");
    Ok(())
}
