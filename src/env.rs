//! Environment constants, store key layout and path utilities.
//!
//! This module centralizes every store key and configuration path used by the
//! engine so the persisted layout is defined in exactly one place.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git, .vscode)
pub const WRANGLE_DIR_NAME: &str = ".wrangle";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "wrangle.toml";

/// Store key segments
pub mod keys {
    /// Prefix shared by all per-session keys
    pub const SESSION_PREFIX: &str = "session";

    /// Session metadata entry
    pub const META_SUFFIX: &str = "meta";

    /// Operation history entry (records plus cursor)
    pub const HISTORY_SUFFIX: &str = "history";

    /// Snapshot entries, one per sequence number
    pub const SNAPSHOT_SEGMENT: &str = "snapshot";

    /// Owner/dataset uniqueness index
    pub const OWNER_PREFIX: &str = "owner";
}

/// Build the key prefix for everything owned by one session
pub fn session_key_prefix(session_id: &str) -> String {
    format!("{}:{}:", keys::SESSION_PREFIX, session_id)
}

/// Build the session metadata key
pub fn session_meta_key(session_id: &str) -> String {
    format!("{}{}", session_key_prefix(session_id), keys::META_SUFFIX)
}

/// Build the session history key
pub fn session_history_key(session_id: &str) -> String {
    format!("{}{}", session_key_prefix(session_id), keys::HISTORY_SUFFIX)
}

/// Build a snapshot key for one sequence number
pub fn session_snapshot_key(session_id: &str, sequence: u64) -> String {
    format!(
        "{}{}:{}",
        session_key_prefix(session_id),
        keys::SNAPSHOT_SEGMENT,
        sequence
    )
}

/// Build the index key that maps an (owner, dataset) pair to its session
pub fn owner_dataset_key(owner_id: &str, dataset_ref: &str) -> String {
    format!("{}:{}:dataset:{}", keys::OWNER_PREFIX, owner_id, dataset_ref)
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(WRANGLE_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(WRANGLE_DIR_NAME).join(CONFIG_FILE_NAME)
}
