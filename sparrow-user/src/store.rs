use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension as _};
use thiserror::Error;

static SCHEMA: &str = include_str!("schema.sql");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("address {0} is already used")]
    AddressTaken(String),
    #[error("username {0} is already used")]
    UsernameTaken(String),
    #[error("no mail account with id {0}")]
    NotFound(i64),
    #[error("mail account {0} is not a mailbox")]
    NotAMailbox(i64),
    #[error("database worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// A row of the `mails` table: a mailbox when `target_id` is empty,
/// an alias of the mailbox `target_id` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub address: String,
    pub target_id: Option<i64>,
    /// UTC
    pub expires_at: Option<NaiveDateTime>,
}

impl Account {
    pub fn is_mailbox(&self) -> bool {
        self.target_id.is_none()
    }

    pub fn is_alias(&self) -> bool {
        self.target_id.is_some()
    }
}

/// An operator of the web front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminUser {
    pub id: i64,
    pub username: String,
    /// argon2 PHC string
    pub password: String,
}

/// Where the database lives. Every call opens its own connection and drops
/// it once done, there is no pooling.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Run `f` against a fresh connection on the blocking thread pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = Connection::open(&path)?;
            f(&mut db)
        })
        .await?
    }
}

pub struct Connection {
    cxn: rusqlite::Connection,
}

const ACCOUNT_COLUMNS: &str = "id, address, target_id, end_date";

impl Connection {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let cxn = rusqlite::Connection::open(path)?;
        cxn.pragma_update(None, "foreign_keys", true)?;
        cxn.busy_timeout(Duration::from_secs(10))?;
        cxn.execute_batch(SCHEMA)?;
        tracing::trace!(path=%path.display(), "database opened");
        Ok(Self { cxn })
    }

    // --- mail accounts ---

    /// Every account, mailboxes and aliases, in creation order.
    pub fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.select_accounts(
            &format!("SELECT {} FROM mails ORDER BY id", ACCOUNT_COLUMNS),
            params![],
        )
    }

    pub fn mailboxes(&self) -> Result<Vec<Account>, StoreError> {
        self.select_accounts(
            &format!(
                "SELECT {} FROM mails WHERE target_id IS NULL ORDER BY id",
                ACCOUNT_COLUMNS
            ),
            params![],
        )
    }

    pub fn aliases_of(&self, mailbox_id: i64) -> Result<Vec<Account>, StoreError> {
        self.select_accounts(
            &format!(
                "SELECT {} FROM mails WHERE target_id = ?1 ORDER BY id",
                ACCOUNT_COLUMNS
            ),
            params![mailbox_id],
        )
    }

    /// Accounts whose expiry is strictly before `now`.
    pub fn expired(&self, now: NaiveDateTime) -> Result<Vec<Account>, StoreError> {
        self.select_accounts(
            &format!(
                "SELECT {} FROM mails WHERE end_date IS NOT NULL AND end_date < ?1 ORDER BY id",
                ACCOUNT_COLUMNS
            ),
            params![now],
        )
    }

    pub fn account(&self, id: i64) -> Result<Option<Account>, StoreError> {
        Ok(self
            .cxn
            .query_row(
                &format!("SELECT {} FROM mails WHERE id = ?1", ACCOUNT_COLUMNS),
                params![id],
                account_from_row,
            )
            .optional()?)
    }

    pub fn add_mailbox(
        &self,
        address: &str,
        expires_at: Option<NaiveDateTime>,
    ) -> Result<i64, StoreError> {
        self.cxn
            .execute(
                "INSERT INTO mails (address, end_date) VALUES (?1, ?2)",
                params![address, expires_at],
            )
            .map_err(|e| address_conflict(address, e))?;
        Ok(self.cxn.last_insert_rowid())
    }

    /// Fails with [`StoreError::NotAMailbox`] when `target_id` is itself an alias.
    pub fn add_alias(
        &mut self,
        address: &str,
        target_id: i64,
        expires_at: Option<NaiveDateTime>,
    ) -> Result<i64, StoreError> {
        let tx = self.cxn.transaction()?;
        let target: Option<Option<i64>> = tx
            .query_row(
                "SELECT target_id FROM mails WHERE id = ?1",
                params![target_id],
                |row| row.get(0),
            )
            .optional()?;
        match target {
            None => return Err(StoreError::NotFound(target_id)),
            Some(Some(_)) => return Err(StoreError::NotAMailbox(target_id)),
            Some(None) => (),
        }

        tx.execute(
            "INSERT INTO mails (address, target_id, end_date) VALUES (?1, ?2, ?3)",
            params![address, target_id, expires_at],
        )
        .map_err(|e| address_conflict(address, e))?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn set_expiry(
        &self,
        id: i64,
        expires_at: Option<NaiveDateTime>,
    ) -> Result<(), StoreError> {
        let changed = self.cxn.execute(
            "UPDATE mails SET end_date = ?1 WHERE id = ?2",
            params![expires_at, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Deleting a mailbox also deletes its aliases. Returns what was removed.
    pub fn delete_account(&mut self, id: i64) -> Result<Vec<Account>, StoreError> {
        let account = self.account(id)?.ok_or(StoreError::NotFound(id))?;
        let mut removed = match account.is_mailbox() {
            true => self.aliases_of(id)?,
            false => vec![],
        };

        let tx = self.cxn.transaction()?;
        tx.execute("DELETE FROM mails WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM mails WHERE id = ?1", params![id])?;
        tx.commit()?;

        removed.push(account);
        Ok(removed)
    }

    fn select_accounts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Account>, StoreError> {
        let mut stmt = self.cxn.prepare(sql)?;
        let rows = stmt.query_map(params, account_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // --- operators ---

    pub fn user(&self, id: i64) -> Result<Option<AdminUser>, StoreError> {
        Ok(self
            .cxn
            .query_row(
                "SELECT id, username, password FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()?)
    }

    pub fn user_by_name(&self, username: &str) -> Result<Option<AdminUser>, StoreError> {
        Ok(self
            .cxn
            .query_row(
                "SELECT id, username, password FROM users WHERE username = ?1",
                params![username],
                user_from_row,
            )
            .optional()?)
    }

    pub fn add_user(&self, username: &str, password_hash: &str) -> Result<i64, StoreError> {
        self.cxn
            .execute(
                "INSERT INTO users (username, password) VALUES (?1, ?2)",
                params![username, password_hash],
            )
            .map_err(|e| match is_constraint_violation(&e) {
                true => StoreError::UsernameTaken(username.into()),
                false => e.into(),
            })?;
        Ok(self.cxn.last_insert_rowid())
    }

    pub fn rename_user(&self, id: i64, username: &str) -> Result<(), StoreError> {
        self.cxn
            .execute(
                "UPDATE users SET username = ?1 WHERE id = ?2",
                params![username, id],
            )
            .map_err(|e| match is_constraint_violation(&e) {
                true => StoreError::UsernameTaken(username.into()),
                false => e.into(),
            })?;
        Ok(())
    }

    pub fn set_user_password(&self, id: i64, password_hash: &str) -> Result<(), StoreError> {
        self.cxn.execute(
            "UPDATE users SET password = ?1 WHERE id = ?2",
            params![password_hash, id],
        )?;
        Ok(())
    }

    /// Returns false when no such user existed.
    pub fn delete_user(&self, username: &str) -> Result<bool, StoreError> {
        let changed = self
            .cxn
            .execute("DELETE FROM users WHERE username = ?1", params![username])?;
        Ok(changed > 0)
    }
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        address: row.get(1)?,
        target_id: row.get(2)?,
        expires_at: row.get(3)?,
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminUser> {
    Ok(AdminUser {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn address_conflict(address: &str, err: rusqlite::Error) -> StoreError {
    match is_constraint_violation(&err) {
        true => StoreError::AddressTaken(address.into()),
        false => err.into(),
    }
}
