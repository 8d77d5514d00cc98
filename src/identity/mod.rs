//! Cross-channel identity service.
//!
//! Maps `(channel, external-id)` pairs to users, lazily creating a user on
//! first contact. Accounts on further channels are attached through short
//! link codes (15-minute expiry, consumed on use). Registered listeners
//! receive identity events on their own tasks so a slow listener can never
//! block the service. State snapshots round-trip through an atomic JSON
//! write with the channel index rebuilt on load.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::PermissionTier;

/// Link-code alphabet: no `0`, `O`, `1`, `I` (confusion-free).
const LINK_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Characters in a link code, excluding the dash.
const LINK_CODE_LEN: usize = 8;

/// Link-code lifetime in minutes.
const LINK_CODE_EXPIRY_MINUTES: i64 = 15;

/// Persona assigned to users created on first contact.
const DEFAULT_PERSONA: &str = "default";

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One `(channel, external-id)` binding on a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub channel: String,
    pub external_id: String,
    pub username: String,
    pub linked_at: DateTime<Utc>,
    pub verified: bool,
    /// Exactly one account per user carries `primary = true`.
    pub primary: bool,
}

/// A person known to the assistant, across all their channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub primary_name: String,
    pub accounts: Vec<LinkedAccount>,
    pub persona_id: String,
    pub permission_tier: PermissionTier,
    pub preferences: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// An active link code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCode {
    pub code: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Identity change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityEventKind {
    UserCreated,
    AccountLinked,
    AccountUnlinked,
    UserDeleted,
}

/// An identity change, fanned out to listeners.
#[derive(Debug, Clone)]
pub struct IdentityEvent {
    pub kind: IdentityEventKind,
    pub user_id: String,
    pub channel: Option<String>,
    pub external_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Listener invoked (on its own task) for every identity event.
pub type IdentityListener = Arc<dyn Fn(IdentityEvent) + Send + Sync>;

/// Identity service errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No user with this id.
    #[error("user not found: {0}")]
    UserNotFound(String),
    /// The link code is unknown, expired, or already used.
    #[error("invalid or expired link code")]
    InvalidCode,
    /// The account is already bound to another user.
    #[error("account {channel}/{external_id} is already linked")]
    AlreadyLinked {
        channel: String,
        external_id: String,
    },
    /// A user must keep at least one account.
    #[error("cannot unlink the last account")]
    LastAccount,
    /// The named account is not on this user.
    #[error("account not found on user")]
    AccountNotFound,
    /// Snapshot I/O failure.
    #[error("identity store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot parse failure.
    #[error("identity store parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// The state lock was poisoned.
    #[error("identity state lock poisoned")]
    Poisoned,
}

/// On-disk snapshot shape.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    users: HashMap<String, User>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct IdentityState {
    users: HashMap<String, User>,
    /// channel → external-id → user-id.
    by_channel: HashMap<String, HashMap<String, String>>,
    link_codes: HashMap<String, LinkCode>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Thread-safe identity service.
pub struct IdentityService {
    state: RwLock<IdentityState>,
    listeners: RwLock<Vec<IdentityListener>>,
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IdentityState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for identity events.
    pub fn add_listener(&self, listener: IdentityListener) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Fan an event out, one task per listener. Listeners must never run
    /// inline where they could block the service.
    fn emit(&self, event: IdentityEvent) {
        let Ok(listeners) = self.listeners.read() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, dropping identity event");
            return;
        };
        for listener in listeners.iter() {
            let listener = Arc::clone(listener);
            let event = event.clone();
            handle.spawn(async move { listener(event) });
        }
    }

    // ── Lookup and lazy creation ──

    /// Resolve an account to its user, creating one on first contact.
    ///
    /// Updates `last_seen_at` on every call.
    pub fn get_or_create(&self, channel: &str, external_id: &str, username: &str) -> User {
        if let Ok(mut state) = self.state.write() {
            let existing = state
                .by_channel
                .get(channel)
                .and_then(|ids| ids.get(external_id))
                .cloned();

            if let Some(user_id) = existing {
                if let Some(user) = state.users.get_mut(&user_id) {
                    user.last_seen_at = Utc::now();
                    return user.clone();
                }
            }

            let now = Utc::now();
            let user = User {
                id: Uuid::new_v4().to_string(),
                primary_name: username.to_owned(),
                accounts: vec![LinkedAccount {
                    channel: channel.to_owned(),
                    external_id: external_id.to_owned(),
                    username: username.to_owned(),
                    linked_at: now,
                    verified: true,
                    primary: true,
                }],
                persona_id: DEFAULT_PERSONA.to_owned(),
                permission_tier: PermissionTier::default(),
                preferences: HashMap::new(),
                created_at: now,
                last_seen_at: now,
            };

            info!(user_id = %user.id, channel, external_id, "created user on first contact");
            state
                .by_channel
                .entry(channel.to_owned())
                .or_default()
                .insert(external_id.to_owned(), user.id.clone());
            state.users.insert(user.id.clone(), user.clone());

            drop(state);
            self.emit(IdentityEvent {
                kind: IdentityEventKind::UserCreated,
                user_id: user.id.clone(),
                channel: Some(channel.to_owned()),
                external_id: Some(external_id.to_owned()),
                timestamp: Utc::now(),
            });
            return user;
        }

        // Lock poisoned: synthesize a throwaway user so the caller can
        // still answer; nothing is persisted.
        warn!("identity lock poisoned, returning ephemeral user");
        let now = Utc::now();
        User {
            id: Uuid::new_v4().to_string(),
            primary_name: username.to_owned(),
            accounts: vec![],
            persona_id: DEFAULT_PERSONA.to_owned(),
            permission_tier: PermissionTier::Restricted,
            preferences: HashMap::new(),
            created_at: now,
            last_seen_at: now,
        }
    }

    /// Fetch a user by id.
    pub fn get(&self, user_id: &str) -> Option<User> {
        let state = self.state.read().ok()?;
        state.users.get(user_id).cloned()
    }

    /// Resolve an account to its user without creating one.
    pub fn find_by_channel(&self, channel: &str, external_id: &str) -> Option<User> {
        let state = self.state.read().ok()?;
        let user_id = state.by_channel.get(channel)?.get(external_id)?;
        state.users.get(user_id).cloned()
    }

    /// Whether any user owns this account.
    pub fn is_linked(&self, channel: &str, external_id: &str) -> bool {
        self.find_by_channel(channel, external_id).is_some()
    }

    /// Number of known users.
    pub fn user_count(&self) -> usize {
        self.state.read().map(|s| s.users.len()).unwrap_or(0)
    }

    // ── Link codes ──

    /// Issue a link code for attaching another channel account.
    ///
    /// Codes are 8 characters from a confusion-free alphabet with a dash
    /// at position 4 (e.g. `A4K2-M9PQ`), unique among active codes, and
    /// expire after 15 minutes or on first use.
    ///
    /// # Errors
    ///
    /// [`IdentityError::UserNotFound`] for unknown users.
    pub fn generate_link_code(&self, user_id: &str) -> Result<String, IdentityError> {
        let mut state = self.state.write().map_err(|_| IdentityError::Poisoned)?;
        if !state.users.contains_key(user_id) {
            return Err(IdentityError::UserNotFound(user_id.to_owned()));
        }

        let code = loop {
            let candidate = random_link_code();
            if !state.link_codes.contains_key(&candidate) {
                break candidate;
            }
        };

        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(chrono::TimeDelta::minutes(LINK_CODE_EXPIRY_MINUTES))
            .unwrap_or(now);
        state.link_codes.insert(
            code.clone(),
            LinkCode {
                code: code.clone(),
                user_id: user_id.to_owned(),
                created_at: now,
                expires_at,
            },
        );

        debug!(user_id, "issued link code");
        Ok(code)
    }

    /// Attach an account to the user behind a link code.
    ///
    /// The code must be active; the account must not belong to anyone.
    /// The new account is non-primary and the code is consumed.
    ///
    /// # Errors
    ///
    /// [`IdentityError::InvalidCode`] or [`IdentityError::AlreadyLinked`].
    pub fn link_account(
        &self,
        code: &str,
        channel: &str,
        external_id: &str,
        username: &str,
    ) -> Result<User, IdentityError> {
        let (user, event) = {
            let mut state = self.state.write().map_err(|_| IdentityError::Poisoned)?;

            let entry = state
                .link_codes
                .get(code)
                .cloned()
                .ok_or(IdentityError::InvalidCode)?;
            if entry.expires_at <= Utc::now() {
                state.link_codes.remove(code);
                return Err(IdentityError::InvalidCode);
            }

            if state
                .by_channel
                .get(channel)
                .and_then(|ids| ids.get(external_id))
                .is_some()
            {
                return Err(IdentityError::AlreadyLinked {
                    channel: channel.to_owned(),
                    external_id: external_id.to_owned(),
                });
            }

            let user_id = entry.user_id.clone();
            let user = state
                .users
                .get_mut(&user_id)
                .ok_or_else(|| IdentityError::UserNotFound(user_id.clone()))?;
            user.accounts.push(LinkedAccount {
                channel: channel.to_owned(),
                external_id: external_id.to_owned(),
                username: username.to_owned(),
                linked_at: Utc::now(),
                verified: true,
                primary: false,
            });
            user.last_seen_at = Utc::now();
            let snapshot = user.clone();

            state
                .by_channel
                .entry(channel.to_owned())
                .or_default()
                .insert(external_id.to_owned(), user_id.clone());
            state.link_codes.remove(code);

            info!(user_id = %user_id, channel, external_id, "account linked");
            (
                snapshot,
                IdentityEvent {
                    kind: IdentityEventKind::AccountLinked,
                    user_id,
                    channel: Some(channel.to_owned()),
                    external_id: Some(external_id.to_owned()),
                    timestamp: Utc::now(),
                },
            )
        };
        self.emit(event);
        Ok(user)
    }

    /// Detach an account. The last account can never be removed; removing
    /// the primary promotes the first remaining account.
    ///
    /// # Errors
    ///
    /// [`IdentityError::LastAccount`], [`IdentityError::AccountNotFound`],
    /// or [`IdentityError::UserNotFound`].
    pub fn unlink_account(
        &self,
        user_id: &str,
        channel: &str,
        external_id: &str,
    ) -> Result<(), IdentityError> {
        let event = {
            let mut state = self.state.write().map_err(|_| IdentityError::Poisoned)?;
            let user = state
                .users
                .get_mut(user_id)
                .ok_or_else(|| IdentityError::UserNotFound(user_id.to_owned()))?;

            if user.accounts.len() <= 1 {
                return Err(IdentityError::LastAccount);
            }
            let index = user
                .accounts
                .iter()
                .position(|a| a.channel == channel && a.external_id == external_id)
                .ok_or(IdentityError::AccountNotFound)?;

            let removed = user.accounts.remove(index);
            if removed.primary {
                if let Some(next) = user.accounts.first_mut() {
                    next.primary = true;
                }
            }
            if let Some(ids) = state.by_channel.get_mut(channel) {
                ids.remove(external_id);
            }

            info!(user_id, channel, external_id, "account unlinked");
            IdentityEvent {
                kind: IdentityEventKind::AccountUnlinked,
                user_id: user_id.to_owned(),
                channel: Some(channel.to_owned()),
                external_id: Some(external_id.to_owned()),
                timestamp: Utc::now(),
            }
        };
        self.emit(event);
        Ok(())
    }

    /// Make the named account the user's primary.
    ///
    /// # Errors
    ///
    /// [`IdentityError::UserNotFound`] or [`IdentityError::AccountNotFound`].
    pub fn set_primary(
        &self,
        user_id: &str,
        channel: &str,
        external_id: &str,
    ) -> Result<(), IdentityError> {
        let mut state = self.state.write().map_err(|_| IdentityError::Poisoned)?;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| IdentityError::UserNotFound(user_id.to_owned()))?;

        if !user
            .accounts
            .iter()
            .any(|a| a.channel == channel && a.external_id == external_id)
        {
            return Err(IdentityError::AccountNotFound);
        }
        for account in &mut user.accounts {
            account.primary = account.channel == channel && account.external_id == external_id;
        }
        Ok(())
    }

    // ── Profile updates ──

    /// Replace a user's preferences map.
    ///
    /// # Errors
    ///
    /// [`IdentityError::UserNotFound`].
    pub fn update_preferences(
        &self,
        user_id: &str,
        preferences: HashMap<String, String>,
    ) -> Result<(), IdentityError> {
        self.with_user(user_id, |user| user.preferences = preferences)
    }

    /// Change a user's persona.
    ///
    /// # Errors
    ///
    /// [`IdentityError::UserNotFound`].
    pub fn update_persona(&self, user_id: &str, persona_id: &str) -> Result<(), IdentityError> {
        self.with_user(user_id, |user| user.persona_id = persona_id.to_owned())
    }

    /// Change a user's permission tier.
    ///
    /// # Errors
    ///
    /// [`IdentityError::UserNotFound`].
    pub fn update_permissions(
        &self,
        user_id: &str,
        tier: PermissionTier,
    ) -> Result<(), IdentityError> {
        self.with_user(user_id, |user| user.permission_tier = tier)
    }

    fn with_user(
        &self,
        user_id: &str,
        mutate: impl FnOnce(&mut User),
    ) -> Result<(), IdentityError> {
        let mut state = self.state.write().map_err(|_| IdentityError::Poisoned)?;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| IdentityError::UserNotFound(user_id.to_owned()))?;
        mutate(user);
        Ok(())
    }

    /// Remove a user and all their account bindings.
    ///
    /// # Errors
    ///
    /// [`IdentityError::UserNotFound`].
    pub fn delete_user(&self, user_id: &str) -> Result<(), IdentityError> {
        let event = {
            let mut state = self.state.write().map_err(|_| IdentityError::Poisoned)?;
            let user = state
                .users
                .remove(user_id)
                .ok_or_else(|| IdentityError::UserNotFound(user_id.to_owned()))?;
            for account in &user.accounts {
                if let Some(ids) = state.by_channel.get_mut(&account.channel) {
                    ids.remove(&account.external_id);
                }
            }
            state.link_codes.retain(|_, c| c.user_id != user_id);

            info!(user_id, "user deleted");
            IdentityEvent {
                kind: IdentityEventKind::UserDeleted,
                user_id: user_id.to_owned(),
                channel: None,
                external_id: None,
                timestamp: Utc::now(),
            }
        };
        self.emit(event);
        Ok(())
    }

    /// Drop expired link codes. Returns how many were removed.
    pub fn cleanup_expired_codes(&self) -> usize {
        let Ok(mut state) = self.state.write() else {
            return 0;
        };
        let now = Utc::now();
        let before = state.link_codes.len();
        state.link_codes.retain(|_, c| c.expires_at > now);
        before.saturating_sub(state.link_codes.len())
    }

    // ── Persistence ──

    /// Write a snapshot (`{users, updated_at}`) atomically.
    ///
    /// # Errors
    ///
    /// [`IdentityError::Io`] or [`IdentityError::Parse`].
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let state = self.state.read().map_err(|_| IdentityError::Poisoned)?;
        let snapshot = Snapshot {
            users: state.users.clone(),
            updated_at: Utc::now(),
        };
        let serialized = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serialized)?;
        if let Err(e) = std::fs::rename(&tmp_path, path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(IdentityError::Io(e));
        }
        Ok(())
    }

    /// Load a snapshot, rebuilding the channel index. A missing file
    /// yields an empty service.
    ///
    /// # Errors
    ///
    /// [`IdentityError::Io`] or [`IdentityError::Parse`].
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let service = Self::new();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no identity snapshot, starting empty");
                return Ok(service);
            }
            Err(e) => return Err(IdentityError::Io(e)),
        };
        let snapshot: Snapshot = serde_json::from_str(&contents)?;

        if let Ok(mut state) = service.state.write() {
            for (user_id, user) in &snapshot.users {
                for account in &user.accounts {
                    state
                        .by_channel
                        .entry(account.channel.clone())
                        .or_default()
                        .insert(account.external_id.clone(), user_id.clone());
                }
            }
            state.users = snapshot.users;
        }
        info!(path = %path.display(), users = service.user_count(), "identity snapshot loaded");
        Ok(service)
    }
}

/// Generate one `XXXX-XXXX` code from the confusion-free alphabet.
fn random_link_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(LINK_CODE_LEN.saturating_add(1));
    for i in 0..LINK_CODE_LEN {
        if i == 4 {
            code.push('-');
        }
        let index = rng.gen_range(0..LINK_CODE_ALPHABET.len());
        code.push(LINK_CODE_ALPHABET[index] as char);
    }
    code
}
