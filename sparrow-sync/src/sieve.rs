use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;

use sparrow_user::config::SieveConfig;

use crate::process::{self, CommandError};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("{0:?} does not map to a sieve script location")]
    InvalidAddress(String),
    #[error("unable to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to run the sieve compiler: {0}")]
    Compiler(#[source] CommandError),
}

/// Outcome of a compilation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Compiler diagnostics, without any reference to the scratch file.
    Invalid(Vec<String>),
}

/// The per-mailbox sieve scripts of the vmail tree,
/// found at `<vmail_dir>/<domain>/<user>/<filename>`.
pub struct SieveTree {
    config: SieveConfig,
}

impl SieveTree {
    pub fn new(config: SieveConfig) -> Self {
        Self { config }
    }

    pub fn resolve_path(&self, address: &str) -> Result<PathBuf, FilterError> {
        let invalid = || FilterError::InvalidAddress(address.to_string());
        let (user, domain) = address.split_once('@').ok_or_else(invalid)?;
        if !is_safe_path_component(user) || !is_safe_path_component(domain) || domain.contains('@')
        {
            return Err(invalid());
        }
        Ok(self
            .config
            .vmail_dir
            .join(domain)
            .join(user)
            .join(&self.config.filename))
    }

    /// Script of `address`, empty when it has none yet.
    pub async fn read(&self, address: &str) -> Result<String, FilterError> {
        let path = self.resolve_path(address)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(address=%address, "no sieve script yet");
                Ok(String::new())
            }
            Err(source) => Err(FilterError::Io { path, source }),
        }
    }

    pub async fn write(&self, address: &str, content: &str) -> Result<(), FilterError> {
        let path = self.resolve_path(address)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FilterError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| FilterError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::info!(address=%address, "sieve script written");
        Ok(())
    }

    /// Every `user@domain` having a directory in the vmail tree, with the
    /// location of its script whether it exists or not.
    pub async fn list(&self) -> Result<BTreeMap<String, PathBuf>, FilterError> {
        let mut found = BTreeMap::new();
        for domain in self.subdirs(&self.config.vmail_dir).await? {
            let domain_dir = self.config.vmail_dir.join(&domain);
            for user in self.subdirs(&domain_dir).await? {
                let script = domain_dir.join(&user).join(&self.config.filename);
                found.insert(format!("{}@{}", user, domain), script);
            }
        }
        Ok(found)
    }

    async fn subdirs(&self, dir: &Path) -> Result<Vec<String>, FilterError> {
        let io = |source: std::io::Error| FilterError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io(e)),
        };

        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.map_err(io)? {
            if !entry.file_type().await.map_err(io)?.is_dir() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(raw) => {
                    tracing::warn!(name=?raw, "skipping non utf-8 directory");
                    continue;
                }
            };
            if self.config.exclude_dirs.contains(&name) {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Compile `content` in a scratch file to learn whether it is valid sieve.
    pub async fn validate(&self, content: &str) -> Result<Validation, FilterError> {
        let scratch = tempfile::Builder::new()
            .prefix("sparrow-")
            .suffix(".sieve")
            .tempfile()
            .map_err(|source| FilterError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let path = scratch.path().to_path_buf();
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| FilterError::Io {
                path: path.clone(),
                source,
            })?;

        let result = process::run(&self.config.compile_command, [&path]).await;

        // sievec leaves its binary next to the source
        let _ = tokio::fs::remove_file(path.with_extension("svbin")).await;

        match result {
            Ok(_) => Ok(Validation::Valid),
            Err(CommandError::Failed {
                status,
                stdout,
                stderr,
                ..
            }) => {
                let mut lines = clean_diagnostics(&path, &stdout, &stderr);
                if lines.is_empty() {
                    lines.push(format!("compiler exited with {}", status));
                }
                tracing::debug!(errors = lines.len(), "sieve script rejected");
                Ok(Validation::Invalid(lines))
            }
            Err(e) => Err(FilterError::Compiler(e)),
        }
    }
}

fn clean_diagnostics(scratch: &Path, stdout: &str, stderr: &str) -> Vec<String> {
    let full = scratch.display().to_string();
    let base = scratch
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    stdout
        .lines()
        .chain(stderr.lines())
        .map(|line| {
            let mut line = line
                .replace(&format!("'{}'", full), "")
                .replace(&format!("{}: ", full), "")
                .replace(&full, "");
            if !base.is_empty() {
                line = line
                    .replace(&format!("'{}'", base), "")
                    .replace(&format!("{}: ", base), "")
                    .replace(&base, "");
            }
            line.trim().to_string()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

fn is_safe_path_component(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && !part.contains(|c| c == '/' || c == '\\' || c == '\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(root: &Path, compiler: &[&str]) -> SieveTree {
        SieveTree::new(SieveConfig {
            vmail_dir: root.to_path_buf(),
            filename: ".dovecot.sieve".into(),
            exclude_dirs: vec!["sieve-after".into()],
            compile_command: compiler.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn path_of_an_address() {
        let t = tree(Path::new("/var/vmail"), &["true"]);
        assert_eq!(
            t.resolve_path("bob@example.com").unwrap(),
            PathBuf::from("/var/vmail/example.com/bob/.dovecot.sieve")
        );
        for bad in [
            "bob",
            "@example.com",
            "bob@",
            "../x@example.com",
            "bob@..",
            "bob@example.com/../../etc",
            "bob@ex@ample.com",
        ] {
            assert!(
                matches!(t.resolve_path(bad), Err(FilterError::InvalidAddress(_))),
                "{} accepted",
                bad
            );
        }
    }

    #[tokio::test]
    async fn read_missing_is_empty_and_write_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path(), &["true"]);

        assert_eq!(t.read("bob@example.com").await.unwrap(), "");
        assert!(!dir.path().join("example.com").exists());

        t.write("bob@example.com", "keep;\n").await.unwrap();
        assert_eq!(t.read("bob@example.com").await.unwrap(), "keep;\n");
        assert!(dir.path().join("example.com/bob/.dovecot.sieve").is_file());
    }

    #[tokio::test]
    async fn list_walks_two_levels_and_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        for d in [
            "example.com/bob",
            "example.com/alice",
            "example.org/carol",
            "sieve-after/global",
            "example.org/sieve-after",
        ] {
            std::fs::create_dir_all(dir.path().join(d)).unwrap();
        }
        std::fs::write(dir.path().join("stray-file"), "").unwrap();
        let t = tree(dir.path(), &["true"]);

        let found = t.list().await.unwrap();
        let keys: Vec<_> = found.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["alice@example.com", "bob@example.com", "carol@example.org"]
        );
        assert_eq!(
            found["bob@example.com"],
            dir.path().join("example.com/bob/.dovecot.sieve")
        );

        let empty = tree(&dir.path().join("nothing-here"), &["true"]);
        assert!(empty.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn valid_script() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path(), &["true"]);
        assert_eq!(t.validate("keep;").await.unwrap(), Validation::Valid);
    }

    #[tokio::test]
    async fn compiler_messages_do_not_leak_the_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo \"$0: line 1: error: unknown command 'kep'.\" >&2; \
                      echo \"sievec(root): Fatal: failed to compile sieve script '$0'\" >&2; \
                      exit 1";
        let t = tree(dir.path(), &["sh", "-c", script]);

        match t.validate("kep;").await.unwrap() {
            Validation::Invalid(lines) => {
                assert_eq!(
                    lines,
                    vec![
                        "line 1: error: unknown command 'kep'.".to_string(),
                        "sievec(root): Fatal: failed to compile sieve script".to_string(),
                    ]
                );
                assert!(lines.iter().all(|l| !l.contains("sparrow-")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_failure_still_explains_itself() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path(), &["false"]);
        match t.validate("keep;").await.unwrap() {
            Validation::Invalid(lines) => {
                assert_eq!(lines.len(), 1);
                assert!(lines[0].starts_with("compiler exited with"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_compiler_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path(), &["/nonexistent/sievec"]);
        assert!(matches!(
            t.validate("keep;").await,
            Err(FilterError::Compiler(CommandError::Spawn { .. }))
        ));
    }
}
