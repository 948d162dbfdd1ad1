mod codec;
mod controller;
mod error;
mod forms;
mod middleware;
mod pages;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use hyper::rt::{Read, Write};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls_pemfile::{certs, private_key};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use sparrow_sync::system::MailSystem;
use sparrow_user::config::{WebConfig, WebUnsecureConfig};
use sparrow_user::login::ArcLoginProvider;

use crate::web::codec::HttpResponse;
use crate::web::controller::Controller;
use crate::web::session::SessionStore;

/// Shared by every request of the front-end.
pub struct WebApp {
    pub(crate) system: Arc<MailSystem>,
    pub(crate) login: ArcLoginProvider,
    pub(crate) sessions: SessionStore,
    /// Set on HTTPS so that browsers never send the session in clear.
    pub(crate) secure_cookie: bool,
}

pub struct Server {
    bind_addr: SocketAddr,
    app: Arc<WebApp>,
    tls: Option<TlsAcceptor>,
}

pub fn new_unsecure(
    config: WebUnsecureConfig,
    system: Arc<MailSystem>,
    login: ArcLoginProvider,
) -> Server {
    Server {
        bind_addr: config.bind_addr,
        app: Arc::new(WebApp {
            system,
            login,
            sessions: SessionStore::default(),
            secure_cookie: false,
        }),
        tls: None,
    }
}

pub fn new(config: WebConfig, system: Arc<MailSystem>, login: ArcLoginProvider) -> Result<Server> {
    let loaded_certs = certs(&mut std::io::BufReader::new(std::fs::File::open(
        config.certs,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut std::io::BufReader::new(std::fs::File::open(
        &config.key,
    )?))?
    .ok_or(anyhow!("no private key found in {}", config.key.display()))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(loaded_certs, loaded_key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    Ok(Server {
        bind_addr: config.bind_addr,
        app: Arc::new(WebApp {
            system,
            login,
            sessions: SessionStore::default(),
            secure_cookie: true,
        }),
        tls: Some(acceptor),
    })
}

trait Stream: Read + Write + Send + Unpin {}
impl<T: Unpin + AsyncRead + AsyncWrite + Send> Stream for TokioIo<T> {}

impl Server {
    pub async fn run(self: Self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("Web front-end listening on {:#}", self.bind_addr);

        let mut connections = FuturesUnordered::new();
        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::debug!("Accepted connection from {}", remote_addr);
            let stream = match self.build_stream(socket).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(err=?e, "TLS acceptor failed");
                    continue;
                }
            };

            let conn = tokio::spawn(serve(self.app.clone(), stream));
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("Web front-end shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

    async fn build_stream(&self, socket: TcpStream) -> Result<Box<dyn Stream>> {
        match self.tls.clone() {
            Some(acceptor) => {
                let stream = acceptor.accept(socket).await?;
                Ok(Box::new(TokioIo::new(stream)))
            }
            None => Ok(Box::new(TokioIo::new(socket))),
        }
    }
}

/// One HTTP/1 connection, requests handled in order.
async fn serve(app: Arc<WebApp>, stream: Box<dyn Stream>) {
    let service = service_fn(move |req: Request<Incoming>| handle(app.clone(), req));
    match http1::Builder::new().serve_connection(stream, service).await {
        Err(e) => tracing::warn!(err=?e, "connection failed"),
        Ok(()) => tracing::trace!("connection terminated with success"),
    }
}

/// Session and access checks, then the page. Failures the pages did not
/// turn into a form error end as a bare 500.
async fn handle(app: Arc<WebApp>, req: Request<Incoming>) -> Result<HttpResponse, http::Error> {
    tracing::info!("{:?} {:?}", req.method(), req.uri());
    let outcome = middleware::auth(app, req, |ctx, request| {
        async { Controller::route(ctx, request).await }.boxed()
    })
    .await;

    match outcome {
        Ok(resp) => Ok(resp),
        Err(e) => {
            tracing::error!(err=?e, "internal error");
            Response::builder()
                .status(500)
                .body(codec::text_body("Internal error"))
        }
    }
}
