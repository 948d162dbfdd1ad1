#![allow(dead_code)]
pub mod constants;

use anyhow::{bail, Context, Result};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::Command;
use std::thread;

use constants::*;

/// Where `sparrowmail --dev` keeps its database and generated files.
pub fn dev_root() -> PathBuf {
    std::env::temp_dir().join("sparrowmail-dev")
}

pub fn sparrowmail_daemon_dev(
    mut fx: impl FnMut(&reqwest::blocking::Client) -> Result<()>,
) -> Result<()> {
    // Check port is not used (= free) before starting the test
    let mut max_retry = 20;
    loop {
        max_retry -= 1;
        match (TcpStream::connect(WEB_ADDR), max_retry) {
            (Ok(_), 0) => bail!("something is listening on {} and prevent the test from starting", WEB_ADDR),
            (Ok(_), _) => println!("something is listening on {}, maybe a previous daemon quitting, retrying soon...", WEB_ADDR),
            (Err(_), _) => {
                println!("test ready to start, {} is free!", WEB_ADDR);
                break
            }
        }
        thread::sleep(SMALL_DELAY);
    }

    // Start daemon
    let mut daemon = Command::new(env!("CARGO_BIN_EXE_sparrowmail"))
        .arg("--dev")
        .arg("daemon")
        .spawn()?;

    // Check that our daemon is correctly listening on the free port
    let mut max_retry = 20;
    loop {
        max_retry -= 1;
        match (TcpStream::connect(WEB_ADDR), max_retry) {
            (Err(e), 0) => bail!("no more retry, last error is: {}", e),
            (Err(e), _) => {
                println!("unable to connect: {} ; will retry soon...", e);
            }
            (Ok(_), _) => break,
        }
        thread::sleep(SMALL_DELAY);
    }

    // Every test starts logged out, with its own cookie jar
    let http = reqwest::blocking::Client::builder()
        .cookie_store(true)
        .build()
        .context("http client must be built")?;

    println!("-- ready to test the web front-end --");
    let result = fx(&http);
    println!("-- test teardown --");

    daemon.kill().context("daemon should be killed")?;
    daemon.wait().context("daemon should be reaped")?;

    result.context("all tests passed")
}

pub fn url(path: &str) -> String {
    format!("{}{}", BASE_URL, path)
}

pub fn login(http: &reqwest::blocking::Client) -> Result<String> {
    let body = http
        .post(url("/login/mails"))
        .form(&[("username", ADMIN_USERNAME), ("password", ADMIN_PASSWORD)])
        .send()?
        .error_for_status()?
        .text()?;
    if !body.contains("Successfully connected") {
        bail!("login failed: {}", body);
    }
    Ok(body)
}

/// Id of the first `/<action>/<id>` link following the last mention of
/// `address`, flashes may quote the address before the listing does.
pub fn id_after(html: &str, address: &str, action: &str) -> Result<i64> {
    let start = html
        .rfind(address)
        .context(format!("{} must be listed", address))?;
    let marker = format!("/{}/", action);
    let rest = &html[start..];
    let link = rest
        .find(&marker)
        .context(format!("{} must have a {} link", address, action))?;
    let digits: String = rest[link + marker.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Ok(digits.parse()?)
}

/// Address with a per run suffix, the dev database outlives the daemon.
pub fn unique_address(local: &str) -> String {
    format!("{}-{}@example.com", local, std::process::id())
}
