use crate::auth::credentials::{
    is_excluded_file_name, persist_record, validate_delete_name, CredentialRecord,
};
use crate::error::{AppError, AppResult};
use futures::future::{BoxFuture, Shared};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Concurrent callers of a refresh / project-id resolution await one shared
/// flight; the error side must be cloneable, hence `String`.
pub type SharedFlight<T> = Shared<BoxFuture<'static, Result<T, String>>>;

/// Model-family cohort with its own rotation cursor. Exhaustion in one group
/// never moves the other group's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Claude,
    Gemini,
}

#[derive(Debug, Default, Clone, Copy)]
struct GroupCursors {
    claude: usize,
    gemini: usize,
}

impl GroupCursors {
    fn get(&self, group: Group) -> usize {
        match group {
            Group::Claude => self.claude,
            Group::Gemini => self.gemini,
        }
    }

    fn set(&mut self, group: Group, value: usize) {
        match group {
            Group::Claude => self.claude = value,
            Group::Gemini => self.gemini = value,
        }
    }

    fn for_each(&mut self, mut f: impl FnMut(usize) -> usize) {
        self.claude = f(self.claude);
        self.gemini = f(self.gemini);
    }
}

pub struct Account {
    pub file_path: PathBuf,
    pub record: CredentialRecord,
    pub in_flight_refresh: Option<SharedFlight<CredentialRecord>>,
    pub in_flight_project_id: Option<SharedFlight<String>>,
    pub refresh_timer: Option<tokio::task::AbortHandle>,
}

impl Account {
    pub fn new(file_path: PathBuf, record: CredentialRecord) -> Self {
        Self {
            file_path,
            record,
            in_flight_refresh: None,
            in_flight_project_id: None,
            refresh_timer: None,
        }
    }

    /// Stable identity used by the quota tracker and selection exclusions.
    pub fn key(&self) -> String {
        self.record
            .email
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| {
                self.file_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown")
                    .to_string()
            })
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.refresh_timer.take() {
            timer.abort();
        }
    }
}

pub struct AccountPool {
    dir: PathBuf,
    pub accounts: Vec<Account>,
    cursors: GroupCursors,
}

impl AccountPool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            accounts: Vec::new(),
            cursors: GroupCursors::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Rebuilds the pool from disk. Files that fail to parse or fail the
    /// shape gate are skipped silently; both cursors reset to 0.
    pub fn load(&mut self) -> AppResult<usize> {
        std::fs::create_dir_all(&self.dir)?;

        for account in &mut self.accounts {
            account.cancel_timer();
        }
        self.accounts.clear();

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().and_then(|e| e.to_str()) == Some("json")
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| !is_excluded_file_name(n))
            })
            .collect();
        entries.sort();

        for path in entries {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    debug!("Skipping unreadable credential file {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_str::<CredentialRecord>(&content) {
                Ok(record) if record.is_loadable() => {
                    self.accounts.push(Account::new(path, record));
                }
                Ok(_) => debug!("Skipping incomplete credential file {:?}", path),
                Err(e) => debug!("Skipping malformed credential file {:?}: {}", path, e),
            }
        }

        self.cursors = GroupCursors::default();
        info!("Loaded {} account(s) from {:?}", self.accounts.len(), self.dir);
        Ok(self.accounts.len())
    }

    pub fn current_index(&self, group: Group) -> usize {
        self.clamp(self.cursors.get(group))
    }

    fn clamp(&self, idx: usize) -> usize {
        if self.accounts.is_empty() {
            0
        } else {
            idx.min(self.accounts.len() - 1)
        }
    }

    pub fn rotate(&mut self, group: Group) {
        if self.accounts.len() <= 1 {
            return;
        }
        let next = (self.cursors.get(group) + 1) % self.accounts.len();
        self.cursors.set(group, next);
    }

    pub fn index_of_path(&self, path: &Path) -> Option<usize> {
        self.accounts.iter().position(|a| a.file_path == path)
    }

    pub fn index_of_file_name(&self, name: &str) -> Option<usize> {
        self.accounts
            .iter()
            .position(|a| a.file_path.file_name().and_then(|n| n.to_str()) == Some(name))
    }

    /// Removes the account backed by `file_name`, cancelling its timer,
    /// deleting the file, and shifting both cursors so they keep pointing at
    /// the same neighbors.
    pub fn delete(&mut self, file_name: &str) -> AppResult<()> {
        validate_delete_name(file_name)?;
        let idx = self
            .index_of_file_name(file_name)
            .ok_or_else(|| AppError::Account(format!("unknown account file: {}", file_name)))?;

        let mut account = self.accounts.remove(idx);
        account.cancel_timer();
        if let Err(e) = std::fs::remove_file(&account.file_path) {
            warn!("Failed to remove credential file {:?}: {}", account.file_path, e);
        }

        let tail = self.accounts.len().saturating_sub(1);
        self.cursors.for_each(|cursor| {
            if idx < cursor {
                cursor - 1
            } else if idx == cursor {
                cursor.min(tail)
            } else {
                cursor
            }
        });
        Ok(())
    }

    /// Adds a record, reusing the slot with the same email when present. On
    /// email mismatch between slot and record the backing file is renamed.
    /// Rotation cursors are untouched unless the pool was empty before.
    pub fn upsert(&mut self, record: CredentialRecord) -> AppResult<PathBuf> {
        let was_empty = self.accounts.is_empty();
        let derived = record.derived_file_name();

        let existing = record.email.as_deref().and_then(|email| {
            self.accounts
                .iter()
                .position(|a| a.record.email.as_deref() == Some(email))
        });

        let path = match existing {
            Some(idx) => {
                let account = &mut self.accounts[idx];
                let target = self.dir.join(&derived);
                if account.file_path != target {
                    if account.file_path.exists() {
                        std::fs::rename(&account.file_path, &target)?;
                    }
                    account.file_path = target;
                }
                account.record = record;
                account.file_path.clone()
            }
            None => {
                let path = self.dir.join(&derived);
                self.accounts.push(Account::new(path.clone(), record));
                path
            }
        };

        let idx = self
            .index_of_path(&path)
            .expect("account just inserted or updated");
        persist_record(&path, &self.accounts[idx].record)?;

        if was_empty {
            self.cursors = GroupCursors::default();
        }
        Ok(path)
    }

    pub fn persist_at(&self, idx: usize) -> AppResult<()> {
        let account = &self.accounts[idx];
        persist_record(&account.file_path, &account.record)
    }

    /// (pool index, account key) pairs in current rotation order.
    pub fn keys(&self) -> Vec<(usize, String)> {
        self.accounts
            .iter()
            .enumerate()
            .map(|(idx, account)| (idx, account.key()))
            .collect()
    }
}
