mod server;

use std::num::NonZeroU64;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use sparrow_sync::dovecot::PasswdFile;
use sparrow_sync::system::MailSystem;
use sparrow_user::config::*;
use sparrow_user::login::{hash_password, verify_password};
use sparrow_user::store::Store;

use server::Server;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// A special mode dedicated to developers, NOT INTENDED FOR PRODUCTION
    #[clap(long)]
    dev: bool,

    #[clap(
        short,
        long,
        env = "SPARROWMAIL_CONFIG",
        default_value = "sparrowmail.toml"
    )]
    /// Path to the main SparrowMail configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the web front-end, and the purge of expired accounts when configured
    Daemon,
    /// Create the account database
    InitDb,
    /// Rewrite the postfix maps and drop stale dovecot credentials
    Sync,
    /// Delete the accounts whose end date has passed
    Purge,

    #[clap(subcommand)]
    /// Manage the operators of the web front-end
    Admin(AdminCommand),

    #[clap(subcommand)]
    /// Specific tooling, should not be part of a normal workflow
    Tools(ToolsCommand),
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Add an operator
    Add {
        #[clap(short, long)]
        username: String,

        #[clap(env = "SPARROWMAIL_PASSWORD")]
        maybe_password: Option<String>,
    },
    /// Delete an operator
    Delete {
        #[clap(short, long)]
        username: String,
    },
    /// Change the password of an operator
    ChangePassword {
        #[clap(env = "SPARROWMAIL_OLD_PASSWORD")]
        maybe_old_password: Option<String>,

        #[clap(env = "SPARROWMAIL_NEW_PASSWORD")]
        maybe_new_password: Option<String>,

        #[clap(short, long)]
        username: String,
    },
}

#[derive(Subcommand, Debug)]
enum ToolsCommand {
    /// Print the dovecot credential of a password, in the configured scheme
    PasswordHash {
        #[clap(env = "SPARROWMAIL_PASSWORD")]
        maybe_password: Option<String>,
    },
}

fn tracer() {
    tracing_subscriber::fmt::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var(
            "RUST_LOG",
            "main=info,sparrowmail=info,sparrow_proto=info,sparrow_sync=info,sparrow_user=info",
        )
    }

    // Abort on panic (same behavior as in Go)
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{}", panic_info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        std::process::abort();
    }));

    tracer();

    let args = Args::parse();
    let config = if args.dev {
        dev_config().await?
    } else {
        read_config(args.config_file.clone())
            .context(format!("'{:?}' must be a configuration file", args.config_file))?
    };

    match &args.command {
        Command::Daemon => {
            let server = Server::from_config(config)?;
            server.run().await?;
        }
        Command::InitDb => {
            let store = Store::new(config.database.clone());
            store.call(|_db| Ok(())).await?;
            tracing::info!(path=%config.database.display(), "database ready");
        }
        Command::Sync => {
            let system = MailSystem::new(&config);
            system.refresh().await?;
            tracing::info!("mail system in sync with the database");
        }
        Command::Purge => {
            let system = MailSystem::new(&config);
            let removed = system
                .purge_expired(chrono::Utc::now().naive_utc())
                .await?;
            for account in removed.iter() {
                println!("{}", account.address);
            }
        }
        Command::Admin(cmd) => admin_management(cmd, Store::new(config.database)).await?,
        Command::Tools(ToolsCommand::PasswordHash { maybe_password }) => {
            let password = match maybe_password {
                Some(pwd) => pwd.clone(),
                None => rpassword::prompt_password("Enter password: ")?,
            };
            let passwd = PasswdFile::new(config.dovecot);
            println!("{}", passwd.hash(&password).await?);
        }
    }

    Ok(())
}

fn new_password(prompt: &str, maybe_password: &Option<String>) -> Result<String> {
    let password = match maybe_password {
        Some(pwd) => pwd.clone(),
        None => {
            let password = rpassword::prompt_password(format!("Enter {}: ", prompt))?;
            let password_confirm = rpassword::prompt_password(format!("Confirm {}: ", prompt))?;
            if password != password_confirm {
                bail!("Passwords don't match.");
            }
            password
        }
    };
    if password.is_empty() {
        bail!("An empty password is not accepted.");
    }
    Ok(password)
}

async fn admin_management(cmd: &AdminCommand, store: Store) -> Result<()> {
    match cmd {
        AdminCommand::Add {
            username,
            maybe_password,
        } => {
            tracing::debug!(user = username, "will-create");
            let password = new_password("password", maybe_password)?;
            let hash = hash_password(&password).context("unable to hash password")?;
            let name = username.clone();
            let id = store.call(move |db| db.add_user(&name, &hash)).await?;
            tracing::info!(user = username, id = id, "operator created");
        }
        AdminCommand::Delete { username } => {
            tracing::debug!(user = username, "will-delete");
            let name = username.clone();
            if !store.call(move |db| db.delete_user(&name)).await? {
                bail!("operator {} does not exist", username);
            }
            tracing::info!(user = username, "operator deleted");
        }
        AdminCommand::ChangePassword {
            maybe_old_password,
            maybe_new_password,
            username,
        } => {
            let name = username.clone();
            let user = store
                .call(move |db| db.user_by_name(&name))
                .await?
                .context("user must exist first")?;

            let old_password = match maybe_old_password {
                Some(pwd) => pwd.to_string(),
                None => rpassword::prompt_password("Enter old password: ")?,
            };
            if !verify_password(&old_password, &user.password)? {
                bail!(format!("invalid password for login {}", username));
            }

            let new_password = new_password("new password", maybe_new_password)?;
            let new_hash = hash_password(&new_password)?;
            store
                .call(move |db| db.set_user_password(user.id, &new_hash))
                .await?;
            tracing::info!(user = username, "operator password changed");
        }
    };

    Ok(())
}

/// Everything under the temp directory, external commands turned into no-ops,
/// and an `alice` / `hunter2` operator.
async fn dev_config() -> Result<Config> {
    use std::net::*;

    let root = std::env::temp_dir().join("sparrowmail-dev");
    std::fs::create_dir_all(root.join("vmail"))
        .context(format!("unable to create {:?}", root))?;
    let noop = || vec!["true".to_string()];

    let config = Config {
        database: root.join("sparrowmail.db"),
        web: None,
        web_unsecure: Some(WebUnsecureConfig {
            bind_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)), 5000),
        }),
        postfix: PostfixConfig {
            aliases_file: root.join("virtual_aliases"),
            mailboxes_file: root.join("virtual_mailboxes"),
            index_command: noop(),
            reload_command: noop(),
        },
        dovecot: DovecotConfig {
            passwd_file: root.join("passwd"),
            reload_command: noop(),
            scheme: PasswordScheme::Ssha512,
        },
        sieve: SieveConfig {
            vmail_dir: root.join("vmail"),
            filename: ".dovecot.sieve".to_string(),
            exclude_dirs: vec![],
            compile_command: noop(),
        },
        purge: Some(PurgeConfig {
            interval_secs: NonZeroU64::MIN.saturating_add(59),
        }),
    };

    let store = Store::new(config.database.clone());
    if store.call(|db| db.user_by_name("alice")).await?.is_none() {
        let hash = hash_password("hunter2")?;
        store.call(move |db| db.add_user("alice", &hash)).await?;
        tracing::info!(user = "alice", "dev operator created");
    }
    tracing::warn!(root=%root.display(), "running with the developer configuration");

    Ok(config)
}
