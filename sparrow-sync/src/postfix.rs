use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use thiserror::Error;

use sparrow_user::config::PostfixConfig;
use sparrow_user::store::Account;

use crate::process::{self, CommandError, NO_ARGS};

/// Steps of a map synchronization, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WriteAliases,
    IndexAliases,
    WriteMailboxes,
    IndexMailboxes,
    Reload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteAliases => write!(f, "writing the alias map"),
            Self::IndexAliases => write!(f, "indexing the alias map"),
            Self::WriteMailboxes => write!(f, "writing the mailbox map"),
            Self::IndexMailboxes => write!(f, "indexing the mailbox map"),
            Self::Reload => write!(f, "reloading postfix"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
    #[error("{stage}: {source}")]
    Command {
        stage: Stage,
        #[source]
        source: CommandError,
    },
}

impl SyncError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Io { stage, .. } | Self::Command { stage, .. } => *stage,
        }
    }
}

/// The lookup tables postfix is given, derived from the account store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Maps {
    /// alias → address of the aliased mailbox
    pub aliases: Vec<(String, String)>,
    pub mailboxes: Vec<String>,
}

impl Maps {
    /// Entries follow account id order so that unchanged data renders to
    /// identical files. Aliases pointing at nothing are skipped.
    pub fn from_accounts(accounts: &[Account]) -> Self {
        let mut sorted: Vec<&Account> = accounts.iter().collect();
        sorted.sort_by_key(|a| a.id);

        let mailbox_by_id: HashMap<i64, &str> = sorted
            .iter()
            .copied()
            .filter(|a| a.is_mailbox())
            .map(|a| (a.id, a.address.as_str()))
            .collect();

        let mut maps = Maps::default();
        for account in sorted {
            match account.target_id {
                None => maps.mailboxes.push(account.address.clone()),
                Some(target) => match mailbox_by_id.get(&target) {
                    Some(mailbox) => maps
                        .aliases
                        .push((account.address.clone(), mailbox.to_string())),
                    None => tracing::warn!(
                        alias=%account.address,
                        target=target,
                        "alias does not point to a mailbox, left out of the map"
                    ),
                },
            }
        }
        maps
    }

    pub fn alias_map(&self) -> String {
        render(self.aliases.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn mailbox_map(&self) -> String {
        render(self.mailboxes.iter().map(|m| (m.as_str(), m.as_str())))
    }
}

fn render<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    entries.fold(String::new(), |mut acc, (key, value)| {
        acc.push_str(key);
        acc.push(' ');
        acc.push_str(value);
        acc.push('\n');
        acc
    })
}

/// The two virtual map files of postfix and the commands applying them.
pub struct PostfixMaps {
    config: PostfixConfig,
}

impl PostfixMaps {
    pub fn new(config: PostfixConfig) -> Self {
        Self { config }
    }

    /// Rewrite both maps, rebuild their indexes, reload postfix.
    /// Stops at the first failing stage, files already written stay as is.
    pub async fn sync(&self, maps: &Maps) -> Result<(), SyncError> {
        let aliases = self.config.aliases_file.as_path();
        let mailboxes = self.config.mailboxes_file.as_path();

        write_map(aliases, maps.alias_map(), Stage::WriteAliases).await?;
        self.index(aliases, Stage::IndexAliases).await?;
        write_map(mailboxes, maps.mailbox_map(), Stage::WriteMailboxes).await?;
        self.index(mailboxes, Stage::IndexMailboxes).await?;

        process::run(&self.config.reload_command, NO_ARGS)
            .await
            .map_err(|source| SyncError::Command {
                stage: Stage::Reload,
                source,
            })?;

        tracing::info!(
            aliases = maps.aliases.len(),
            mailboxes = maps.mailboxes.len(),
            "postfix maps updated"
        );
        Ok(())
    }

    async fn index(&self, map: &Path, stage: Stage) -> Result<(), SyncError> {
        process::run(&self.config.index_command, [map])
            .await
            .map_err(|source| SyncError::Command { stage, source })?;
        Ok(())
    }
}

async fn write_map(path: &Path, content: String, stage: Stage) -> Result<(), SyncError> {
    tracing::debug!(path=%path.display(), "writing map");
    tokio::fs::write(path, content)
        .await
        .map_err(|source| SyncError::Io { stage, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn mailbox(id: i64, address: &str) -> Account {
        Account {
            id,
            address: address.into(),
            target_id: None,
            expires_at: None,
        }
    }

    fn alias(id: i64, address: &str, target: i64) -> Account {
        Account {
            id,
            address: address.into(),
            target_id: Some(target),
            expires_at: None,
        }
    }

    fn config(dir: &Path, index: &[&str]) -> PostfixConfig {
        PostfixConfig {
            aliases_file: dir.join("aliases"),
            mailboxes_file: dir.join("mailboxes"),
            index_command: index.iter().map(|s| s.to_string()).collect(),
            reload_command: vec!["true".into()],
        }
    }

    #[test]
    fn one_line_per_account() {
        let accounts = vec![
            alias(4, "postmaster@example.com", 1),
            mailbox(1, "bob@example.com"),
            mailbox(2, "alice@example.com"),
            alias(3, "abuse@example.com", 1),
            alias(5, "a@example.com", 2),
            mailbox(6, "carol@example.com"),
        ];
        let maps = Maps::from_accounts(&accounts);

        assert_eq!(
            maps.alias_map(),
            "abuse@example.com bob@example.com\n\
             postmaster@example.com bob@example.com\n\
             a@example.com alice@example.com\n"
        );
        assert_eq!(
            maps.mailbox_map(),
            "bob@example.com bob@example.com\n\
             alice@example.com alice@example.com\n\
             carol@example.com carol@example.com\n"
        );
        assert_eq!(maps.alias_map().lines().count(), 3);
        assert_eq!(maps.mailbox_map().lines().count(), 3);
    }

    #[test]
    fn dangling_aliases_are_left_out() {
        let accounts = vec![mailbox(1, "bob@example.com"), alias(2, "lost@example.com", 9)];
        let maps = Maps::from_accounts(&accounts);
        assert!(maps.aliases.is_empty());
        assert_eq!(maps.mailboxes, vec!["bob@example.com".to_string()]);
    }

    #[test]
    fn empty_store_gives_empty_maps() {
        let maps = Maps::from_accounts(&[]);
        assert_eq!(maps.alias_map(), "");
        assert_eq!(maps.mailbox_map(), "");
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let postfix = PostfixMaps::new(config(dir.path(), &["true"]));
        let maps = Maps::from_accounts(&[
            mailbox(1, "bob@example.com"),
            alias(2, "b@example.com", 1),
        ]);

        postfix.sync(&maps).await.unwrap();
        let first = (
            std::fs::read(dir.path().join("aliases")).unwrap(),
            std::fs::read(dir.path().join("mailboxes")).unwrap(),
        );
        postfix.sync(&maps).await.unwrap();
        let second = (
            std::fs::read(dir.path().join("aliases")).unwrap(),
            std::fs::read(dir.path().join("mailboxes")).unwrap(),
        );

        assert_eq!(first, second);
        assert_eq!(first.0, b"b@example.com bob@example.com\n");
        assert_eq!(first.1, b"bob@example.com bob@example.com\n");
    }

    #[tokio::test]
    async fn index_failure_stops_the_sync() {
        let dir = tempfile::tempdir().unwrap();
        let postfix = PostfixMaps::new(config(dir.path(), &["false"]));
        let maps = Maps::from_accounts(&[mailbox(1, "bob@example.com")]);

        let err = postfix.sync(&maps).await.unwrap_err();
        assert_eq!(err.stage(), Stage::IndexAliases);
        assert!(dir.path().join("aliases").exists());
        assert!(!dir.path().join("mailboxes").exists());
    }

    #[tokio::test]
    async fn index_receives_the_map_path() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("indexed");
        let script = format!("echo \"$0\" >> {}", log.display());
        let postfix = PostfixMaps::new(config(dir.path(), &["sh", "-c", script.as_str()]));

        postfix.sync(&Maps::default()).await.unwrap();
        let indexed = std::fs::read_to_string(&log).unwrap();
        let indexed: Vec<PathBuf> = indexed.lines().map(PathBuf::from).collect();
        assert_eq!(
            indexed,
            vec![dir.path().join("aliases"), dir.path().join("mailboxes")]
        );
    }

    #[tokio::test]
    async fn unwritable_map_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &["true"]);
        cfg.aliases_file = dir.path().join("missing").join("aliases");
        let err = PostfixMaps::new(cfg)
            .sync(&Maps::default())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Stage::WriteAliases);
    }
}
