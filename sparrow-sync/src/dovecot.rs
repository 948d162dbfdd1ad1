use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;

use sparrow_user::config::{CommandLine, DovecotConfig, PasswordScheme};

use crate::process::{self, CommandError, NO_ARGS};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("{0:?} can not be stored in a passwd file")]
    InvalidAddress(String),
    #[error("unable to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to hash password: {0}")]
    Hash(#[source] CommandError),
    #[error("unable to reload dovecot: {0}")]
    Reload(#[source] CommandError),
}

/// The `address:hash` passwd-file read by dovecot's passdb.
pub struct PasswdFile {
    path: PathBuf,
    scheme: PasswordScheme,
    reload_command: CommandLine,
}

impl PasswdFile {
    pub fn new(config: DovecotConfig) -> Self {
        Self {
            path: config.passwd_file,
            scheme: config.scheme,
            reload_command: config.reload_command,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// A fresh salted hash of `password`, in dovecot's `{SSHA512}` notation.
    pub async fn hash(&self, password: &str) -> Result<String, CredentialError> {
        match &self.scheme {
            PasswordScheme::Ssha512 => Ok(ssha512::hash(password)),
            PasswordScheme::Doveadm(doveadm) => {
                let out = process::run(doveadm, ["pw", "-s", "SSHA512", "-p", password])
                    .await
                    .map_err(CredentialError::Hash)?;
                Ok(out.stdout.trim().to_string())
            }
        }
    }

    async fn verify(&self, password: &str, hash: &str) -> Result<bool, CredentialError> {
        match &self.scheme {
            PasswordScheme::Ssha512 => Ok(ssha512::verify(password, hash)),
            PasswordScheme::Doveadm(doveadm) => {
                match process::run(doveadm, ["pw", "-t", hash, "-p", password]).await {
                    Ok(_) => Ok(true),
                    Err(CommandError::Failed { .. }) => Ok(false),
                    Err(e) => Err(CredentialError::Hash(e)),
                }
            }
        }
    }

    /// Append an entry. An existing entry for the same address is not replaced.
    pub async fn add(&self, address: &str, password: &str) -> Result<(), CredentialError> {
        check_address(address)?;
        let hash = self.hash(password).await?;

        let existing = self.read().await?;
        let mut entry = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            entry.push('\n');
        }
        entry.push_str(&format!("{}:{}\n", address, hash));

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io(e))?;
        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| self.io(e))?;
        file.flush().await.map_err(|e| self.io(e))?;

        tracing::info!(address=%address, "credential added");
        self.reload().await
    }

    /// Test `password` against the first entry of `address`.
    pub async fn check(&self, address: &str, password: &str) -> Result<bool, CredentialError> {
        let content = self.read().await?;
        let hash = match content
            .lines()
            .find(|line| entry_address(line) == Some(address))
            .and_then(entry_hash)
        {
            Some(h) => h,
            None => {
                tracing::debug!(address=%address, "no credential for this address");
                return Ok(false);
            }
        };
        self.verify(password, hash).await
    }

    /// Replace the hash of the first entry of `address`, other fields are kept.
    /// Returns false, without creating anything, when there is no such entry.
    pub async fn change(&self, address: &str, password: &str) -> Result<bool, CredentialError> {
        let content = self.read().await?;
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        let position = match lines
            .iter()
            .position(|line| entry_address(line) == Some(address))
        {
            Some(p) => p,
            None => {
                tracing::warn!(address=%address, "no credential to change");
                return Ok(false);
            }
        };

        let hash = self.hash(password).await?;
        let line = &lines[position];
        let rest = line[address.len() + 1..]
            .split_once(':')
            .map(|(_, extra)| format!(":{}", extra))
            .unwrap_or_default();
        lines[position] = format!("{}:{}{}", address, hash, rest);

        self.write_lines(&lines).await?;
        tracing::info!(address=%address, "credential changed");
        self.reload().await?;
        Ok(true)
    }

    /// Drop every entry whose address is not in `valid`. Kept lines are
    /// written back untouched and in their original order.
    pub async fn prune(&self, valid: &HashSet<String>) -> Result<usize, CredentialError> {
        let content = self.read().await?;
        let (kept, dropped): (Vec<&str>, Vec<&str>) = content
            .lines()
            .partition(|line| entry_address(line).map_or(false, |a| valid.contains(a)));

        for line in dropped.iter() {
            if let Some(address) = entry_address(line) {
                tracing::info!(address=%address, "credential pruned");
            }
        }

        self.write_lines(&kept).await?;
        self.reload().await?;
        Ok(dropped.len())
    }

    async fn read(&self) -> Result<String, CredentialError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(self.io(e)),
        }
    }

    async fn write_lines<S: AsRef<str>>(&self, lines: &[S]) -> Result<(), CredentialError> {
        let content = lines.iter().fold(String::new(), |mut acc, line| {
            acc.push_str(line.as_ref());
            acc.push('\n');
            acc
        });
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| self.io(e))
    }

    async fn reload(&self) -> Result<(), CredentialError> {
        process::run(&self.reload_command, NO_ARGS)
            .await
            .map_err(CredentialError::Reload)?;
        Ok(())
    }

    fn io(&self, source: std::io::Error) -> CredentialError {
        CredentialError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn check_address(address: &str) -> Result<(), CredentialError> {
    if address.is_empty() || address.contains(|c| c == ':' || c == '\n' || c == '\r') {
        return Err(CredentialError::InvalidAddress(address.into()));
    }
    Ok(())
}

fn entry_address(line: &str) -> Option<&str> {
    line.split_once(':').map(|(address, _)| address)
}

fn entry_hash(line: &str) -> Option<&str> {
    line.split(':').nth(1)
}

/// Dovecot's SSHA512: base64(SHA512(password ‖ salt) ‖ salt)
pub mod ssha512 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use rand::RngCore;
    use sha2::{Digest, Sha512};

    pub const PREFIX: &str = "{SSHA512}";
    const DIGEST_LEN: usize = 64;
    const SALT_LEN: usize = 16;

    pub fn hash(password: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        encode(password, &salt)
    }

    pub(crate) fn encode(password: &str, salt: &[u8]) -> String {
        let mut raw = digest(password, salt);
        raw.extend_from_slice(salt);
        format!("{}{}", PREFIX, STANDARD.encode(raw))
    }

    pub fn verify(password: &str, hash: &str) -> bool {
        let b64 = match hash.strip_prefix(PREFIX) {
            Some(v) => v.trim(),
            None => return false,
        };
        let raw = match STANDARD.decode(b64) {
            Ok(v) => v,
            Err(_) => return false,
        };
        if raw.len() <= DIGEST_LEN {
            return false;
        }
        let (expected, salt) = raw.split_at(DIGEST_LEN);
        digest(password, salt) == expected
    }

    fn digest(password: &str, salt: &[u8]) -> Vec<u8> {
        let mut hasher = Sha512::new();
        hasher.update(password.as_bytes());
        hasher.update(salt);
        hasher.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passwd(dir: &Path, reload: &str) -> PasswdFile {
        PasswdFile::new(DovecotConfig {
            passwd_file: dir.join("passwd"),
            reload_command: vec![reload.into()],
            scheme: PasswordScheme::Ssha512,
        })
    }

    /// `doveadm` stand-in: `pw -s SSHA512 -p <pw>` prints `{PLAIN}<pw>`,
    /// `pw -t <hash> -p <pw>` succeeds when the hash is `{PLAIN}<pw>`.
    fn doveadm_passwd(dir: &Path) -> PasswdFile {
        let script = r#"
case "$1" in
  -s) printf '  {PLAIN}%s\n' "$4" ;;
  -t) [ "$2" = "{PLAIN}$4" ] || { echo "Password mismatch" >&2; exit 1; } ;;
  *) exit 2 ;;
esac
"#;
        PasswdFile::new(DovecotConfig {
            passwd_file: dir.join("passwd"),
            reload_command: vec!["true".into()],
            scheme: PasswordScheme::Doveadm(vec![
                "sh".into(),
                "-c".into(),
                format!("shift; {}", script),
                "doveadm".into(),
            ]),
        })
    }

    fn set(addresses: &[&str]) -> HashSet<String> {
        addresses.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ssha512_format() {
        let hash = ssha512::encode("hunter2", b"saltsalt");
        assert!(hash.starts_with("{SSHA512}"));
        assert!(ssha512::verify("hunter2", &hash));
        assert!(!ssha512::verify("hunter3", &hash));
        assert!(!ssha512::verify("hunter2", "{SHA512}abcd"));
        assert!(!ssha512::verify("hunter2", "{SSHA512}!!!"));
        assert_ne!(ssha512::hash("hunter2"), ssha512::hash("hunter2"));
    }

    #[tokio::test]
    async fn add_then_check() {
        let dir = tempfile::tempdir().unwrap();
        let pw = passwd(dir.path(), "true");

        assert!(!pw.check("bob@example.com", "hunter2").await.unwrap());

        pw.add("bob@example.com", "hunter2").await.unwrap();
        pw.add("alice@example.com", "correct horse").await.unwrap();

        assert!(pw.check("bob@example.com", "hunter2").await.unwrap());
        assert!(!pw.check("bob@example.com", "correct horse").await.unwrap());
        assert!(pw.check("alice@example.com", "correct horse").await.unwrap());
        assert!(!pw.check("carol@example.com", "hunter2").await.unwrap());
        assert!(!pw.check("bob@example", "hunter2").await.unwrap());

        let content = std::fs::read_to_string(dir.path().join("passwd")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("bob@example.com:{SSHA512}"));
    }

    #[tokio::test]
    async fn duplicates_only_first_entry_counts() {
        let dir = tempfile::tempdir().unwrap();
        let pw = passwd(dir.path(), "true");

        pw.add("bob@example.com", "first").await.unwrap();
        pw.add("bob@example.com", "second").await.unwrap();
        assert!(pw.check("bob@example.com", "first").await.unwrap());
        assert!(!pw.check("bob@example.com", "second").await.unwrap());

        assert!(pw.change("bob@example.com", "third").await.unwrap());
        assert!(pw.check("bob@example.com", "third").await.unwrap());
        let content = std::fs::read_to_string(dir.path().join("passwd")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn change_keeps_other_fields_and_never_creates() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("passwd");
        let old = ssha512::encode("old", b"12345678");
        std::fs::write(&file, format!("bob@example.com:{}:5000:5000::/var/vmail/bob\n", old)).unwrap();
        let pw = passwd(dir.path(), "true");

        assert!(!pw.change("alice@example.com", "new").await.unwrap());
        assert!(pw.change("bob@example.com", "new").await.unwrap());

        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.ends_with(":5000:5000::/var/vmail/bob\n"));
        assert!(pw.check("bob@example.com", "new").await.unwrap());
        assert!(!pw.check("bob@example.com", "old").await.unwrap());
    }

    #[tokio::test]
    async fn prune_keeps_order_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("passwd");
        std::fs::write(
            &file,
            "a@example.com:{SSHA512}AAAA\n\
             b@example.com:{SSHA512}BBBB\n\
             c@example.com:{SSHA512}CCCC\n\
             d@example.com:{SSHA512}DDDD\n",
        )
        .unwrap();
        let pw = passwd(dir.path(), "true");

        let removed = pw
            .prune(&set(&["d@example.com", "b@example.com", "z@example.com"]))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "b@example.com:{SSHA512}BBBB\nd@example.com:{SSHA512}DDDD\n"
        );
    }

    #[tokio::test]
    async fn prune_of_missing_file_creates_an_empty_one() {
        let dir = tempfile::tempdir().unwrap();
        let pw = passwd(dir.path(), "true");
        assert_eq!(pw.prune(&set(&["a@example.com"])).await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(pw.path()).unwrap(), "");
    }

    #[tokio::test]
    async fn reload_failure_is_reported_after_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let pw = passwd(dir.path(), "false");

        assert!(matches!(
            pw.add("bob@example.com", "hunter2").await,
            Err(CredentialError::Reload(_))
        ));
        assert!(pw.check("bob@example.com", "hunter2").await.unwrap());
    }

    #[tokio::test]
    async fn addresses_that_would_break_the_file_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let pw = passwd(dir.path(), "true");
        for bad in ["", "bob:x@example.com", "bob@example.com\nroot"] {
            assert!(matches!(
                pw.add(bad, "hunter2").await,
                Err(CredentialError::InvalidAddress(_))
            ));
        }
        assert!(!dir.path().join("passwd").exists());
    }

    #[tokio::test]
    async fn missing_trailing_newline_does_not_merge_entries() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("passwd");
        std::fs::write(&file, "a@example.com:{SSHA512}AAAA").unwrap();
        let pw = passwd(dir.path(), "true");

        pw.add("b@example.com", "hunter2").await.unwrap();
        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(pw.check("b@example.com", "hunter2").await.unwrap());
    }

    #[tokio::test]
    async fn doveadm_hash_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let pw = doveadm_passwd(dir.path());
        assert_eq!(pw.hash("hunter2").await.unwrap(), "{PLAIN}hunter2");
    }

    #[tokio::test]
    async fn doveadm_mismatch_is_a_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let pw = doveadm_passwd(dir.path());
        pw.add("bob@example.com", "hunter2").await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("passwd")).unwrap();
        assert_eq!(content, "bob@example.com:{PLAIN}hunter2\n");
        assert!(pw.check("bob@example.com", "hunter2").await.unwrap());
        assert!(!pw.check("bob@example.com", "hunter3").await.unwrap());
    }

    #[tokio::test]
    async fn doveadm_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let pw = PasswdFile::new(DovecotConfig {
            passwd_file: dir.path().join("passwd"),
            reload_command: vec!["true".into()],
            scheme: PasswordScheme::Doveadm(vec!["/nonexistent/doveadm".into()]),
        });
        assert!(matches!(
            pw.hash("hunter2").await,
            Err(CredentialError::Hash(CommandError::Spawn { .. }))
        ));

        std::fs::write(dir.path().join("passwd"), "bob@example.com:{PLAIN}hunter2\n").unwrap();
        assert!(matches!(
            pw.check("bob@example.com", "hunter2").await,
            Err(CredentialError::Hash(CommandError::Spawn { .. }))
        ));
    }
}
