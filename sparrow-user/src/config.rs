use std::io::Read;
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::path::PathBuf;

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A program followed by its leading arguments, e.g. `["systemctl", "reload", "postfix"]`.
/// Operation specific arguments (a file path, a password) are appended at call time.
pub type CommandLine = Vec<String>;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// SQLite database holding mail accounts and operators
    pub database: PathBuf,

    pub web: Option<WebConfig>,
    pub web_unsecure: Option<WebUnsecureConfig>,

    pub postfix: PostfixConfig,
    pub dovecot: DovecotConfig,
    pub sieve: SieveConfig,

    pub purge: Option<PurgeConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebConfig {
    pub bind_addr: SocketAddr,
    pub certs: PathBuf,
    pub key: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebUnsecureConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PostfixConfig {
    /// in postfix conf: virtual_alias_maps
    pub aliases_file: PathBuf,
    /// in postfix conf: virtual_mailbox_maps
    pub mailboxes_file: PathBuf,
    #[serde(default = "default_index_command")]
    pub index_command: CommandLine,
    #[serde(default = "default_postfix_reload")]
    pub reload_command: CommandLine,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DovecotConfig {
    /// in dovecot conf: passdb { args = username_format=%u scheme=ssha512 <file> }
    pub passwd_file: PathBuf,
    #[serde(default = "default_dovecot_reload")]
    pub reload_command: CommandLine,
    #[serde(default)]
    pub scheme: PasswordScheme,
}

/// How credential hashes are produced and checked.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PasswordScheme {
    /// `{SSHA512}` computed in process
    #[default]
    Ssha512,
    /// Delegate to `doveadm pw`, the given command line being the doveadm binary
    Doveadm(CommandLine),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SieveConfig {
    /// Tree must look like <vmail_dir>/<domain>/<user>/
    pub vmail_dir: PathBuf,
    /// in dovecot conf: plugin { sieve = <file> }
    #[serde(default = "default_sieve_filename")]
    pub filename: String,
    /// Directories of the vmail tree that are neither domains nor users
    #[serde(default)]
    pub exclude_dirs: Vec<String>,
    #[serde(default = "default_compile_command")]
    pub compile_command: CommandLine,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PurgeConfig {
    pub interval_secs: NonZeroU64,
}

pub fn read_config<T: DeserializeOwned>(config_file: PathBuf) -> Result<T> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

fn default_index_command() -> CommandLine {
    vec!["postmap".into()]
}

fn default_postfix_reload() -> CommandLine {
    vec!["systemctl".into(), "reload".into(), "postfix".into()]
}

fn default_dovecot_reload() -> CommandLine {
    vec!["systemctl".into(), "reload".into(), "dovecot".into()]
}

fn default_sieve_filename() -> String {
    ".dovecot.sieve".into()
}

fn default_compile_command() -> CommandLine {
    vec!["sievec".into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
database = "/var/lib/sparrowmail/sparrowmail.db"

[web_unsecure]
bind_addr = "[::1]:5000"

[postfix]
aliases_file = "/etc/postfix/virtual_aliases"
mailboxes_file = "/etc/postfix/virtual_mailboxes"

[dovecot]
passwd_file = "/etc/dovecot/passwd"
scheme = { doveadm = ["/usr/bin/doveadm"] }

[sieve]
vmail_dir = "/var/vmail"
exclude_dirs = ["sieve-after"]
"#;

    #[test]
    fn parse_with_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert!(config.web.is_none());
        assert_eq!(config.web_unsecure.unwrap().bind_addr.port(), 5000);
        assert_eq!(config.postfix.index_command, vec!["postmap".to_string()]);
        assert_eq!(
            config.postfix.reload_command,
            vec!["systemctl", "reload", "postfix"]
        );
        assert_eq!(
            config.dovecot.scheme,
            PasswordScheme::Doveadm(vec!["/usr/bin/doveadm".into()])
        );
        assert_eq!(config.sieve.filename, ".dovecot.sieve");
        assert_eq!(config.sieve.compile_command, vec!["sievec".to_string()]);
        assert!(config.purge.is_none());
    }

    #[test]
    fn scheme_defaults_to_native_ssha512() {
        let dovecot: DovecotConfig = toml::from_str(r#"passwd_file = "/tmp/passwd""#).unwrap();
        assert_eq!(dovecot.scheme, PasswordScheme::Ssha512);
    }

    #[test]
    fn purge_interval_must_not_be_zero() {
        let purge: PurgeConfig = toml::from_str("interval_secs = 3600").unwrap();
        assert_eq!(purge.interval_secs.get(), 3600);
        assert!(toml::from_str::<PurgeConfig>("interval_secs = 0").is_err());
    }
}
