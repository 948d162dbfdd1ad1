use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::try_join;
use tokio::sync::watch;

use sparrow_proto::web;
use sparrow_sync::system::MailSystem;
use sparrow_user::config::{Config, PurgeConfig};
use sparrow_user::login::{ArcLoginProvider, StoreLoginProvider};

pub struct Server {
    web_server: Option<web::Server>,
    web_unsecure_server: Option<web::Server>,
    purge: Option<PurgeConfig>,
    system: Arc<MailSystem>,
}

impl Server {
    pub fn from_config(config: Config) -> Result<Self> {
        if config.web.is_none() && config.web_unsecure.is_none() {
            bail!("Neither [web] nor [web_unsecure] is set up in the config file");
        }

        let system = Arc::new(MailSystem::new(&config));
        let login: ArcLoginProvider = Arc::new(StoreLoginProvider::new(system.store.clone()));

        let web_server = config
            .web
            .map(|cfg| web::new(cfg, system.clone(), login.clone()))
            .transpose()?;
        let web_unsecure_server = config
            .web_unsecure
            .map(|cfg| web::new_unsecure(cfg, system.clone(), login.clone()));

        Ok(Self {
            web_server,
            web_unsecure_server,
            purge: config.purge,
            system,
        })
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting SparrowMail...");

        // the sender must outlive the servers, a dropped one reads as a change
        let (exit_signal, _provoke_exit) = watch_ctrl_c();

        let Self {
            web_server,
            web_unsecure_server,
            purge,
            system,
        } = self;
        try_join!(
            async {
                match web_server {
                    None => Ok(()),
                    Some(s) => s.run(exit_signal.clone()).await,
                }
            },
            async {
                match web_unsecure_server {
                    None => Ok(()),
                    Some(s) => s.run(exit_signal.clone()).await,
                }
            },
            async {
                match purge {
                    None => Ok(()),
                    Some(p) => {
                        system
                            .run_purge(Duration::from_secs(p.interval_secs.get()), exit_signal.clone())
                            .await
                    }
                }
            },
        )?;

        Ok(())
    }
}

pub fn watch_ctrl_c() -> (watch::Receiver<bool>, Arc<watch::Sender<bool>>) {
    let (send_cancel, watch_cancel) = watch::channel(false);
    let send_cancel = Arc::new(send_cancel);
    let send_cancel_2 = send_cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(err=?e, "failed to install CTRL+C signal handler");
            return;
        }
        tracing::info!("Received CTRL+C, shutting down.");
        let _ = send_cancel.send(true);
    });
    (watch_cancel, send_cancel_2)
}
