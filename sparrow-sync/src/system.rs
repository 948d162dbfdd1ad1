use std::collections::HashSet;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;

use sparrow_user::config::Config;
use sparrow_user::store::{Account, Store, StoreError};

use crate::dovecot::{CredentialError, PasswdFile};
use crate::postfix::{Maps, PostfixMaps, SyncError};
use crate::sieve::SieveTree;

const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("postfix: {0}")]
    Postfix(#[from] SyncError),
    #[error("dovecot: {0}")]
    Dovecot(#[from] CredentialError),
}

/// The account store together with every file derived from it.
pub struct MailSystem {
    pub store: Store,
    pub postfix: PostfixMaps,
    pub passwd: PasswdFile,
    pub sieve: SieveTree,
}

impl MailSystem {
    pub fn new(config: &Config) -> Self {
        Self {
            store: Store::new(config.database.clone()),
            postfix: PostfixMaps::new(config.postfix.clone()),
            passwd: PasswdFile::new(config.dovecot.clone()),
            sieve: SieveTree::new(config.sieve.clone()),
        }
    }

    /// Mirror the store into the postfix maps, then drop the credentials
    /// of addresses that are no longer mailboxes.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let accounts = self.store.call(|db| db.accounts()).await?;
        let maps = Maps::from_accounts(&accounts);
        self.postfix.sync(&maps).await?;

        let valid: HashSet<String> = maps.mailboxes.into_iter().collect();
        let pruned = self.passwd.prune(&valid).await?;
        if pruned > 0 {
            tracing::info!(pruned = pruned, "stale credentials removed");
        }
        Ok(())
    }

    /// Delete accounts that expired before `now` and refresh when some were.
    pub async fn purge_expired(&self, now: NaiveDateTime) -> Result<Vec<Account>, RefreshError> {
        let removed = self
            .store
            .call(move |db| {
                let mut removed: Vec<Account> = vec![];
                for account in db.expired(now)? {
                    // already gone with its mailbox
                    if removed.iter().any(|r| r.id == account.id) {
                        continue;
                    }
                    removed.extend(db.delete_account(account.id)?);
                }
                Ok(removed)
            })
            .await?;

        for account in removed.iter() {
            tracing::info!(address=%account.address, "expired account deleted");
        }
        if !removed.is_empty() {
            self.refresh().await?;
        }
        Ok(removed)
    }

    /// Purge every `interval` until `must_exit` flips.
    pub async fn run_purge(
        &self,
        interval: Duration,
        mut must_exit: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let interval = match interval < MIN_PURGE_INTERVAL {
            true => {
                tracing::warn!(requested=?interval, "purge interval too short, using one second");
                MIN_PURGE_INTERVAL
            }
            false => interval,
        };
        tracing::info!(every_secs = interval.as_secs(), "purge of expired accounts enabled");
        let mut ticker = tokio::time::interval(interval);

        while !*must_exit.borrow() {
            tokio::select! {
                _ = ticker.tick() => (),
                _ = must_exit.changed() => continue,
            };

            match self.purge_expired(Utc::now().naive_utc()).await {
                Ok(removed) if removed.is_empty() => tracing::debug!("nothing to purge"),
                Ok(removed) => tracing::info!(removed = removed.len(), "purge done"),
                Err(e) => tracing::error!(err=?e, "purge failed"),
            }
        }

        tracing::info!("purge loop stopped");
        Ok(())
    }
}
