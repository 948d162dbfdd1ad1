use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::store::{AdminUser, Store};

/// Checks operator credentials for the web front-end.
#[async_trait]
pub trait LoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<AdminUser>;
}

pub type ArcLoginProvider = Arc<dyn LoginProvider + Send + Sync>;

/// Operators stored in the `users` table of the account database.
pub struct StoreLoginProvider {
    store: Store,
}

impl StoreLoginProvider {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LoginProvider for StoreLoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<AdminUser> {
        tracing::debug!(user=%username, "login");
        let name = username.to_string();
        let user = match self.store.call(move |db| db.user_by_name(&name)).await? {
            None => bail!("User {} does not exist", username),
            Some(u) => u,
        };

        tracing::debug!(user=%username, "verify password");
        if !verify_password(password, &user.password)? {
            bail!("Wrong password");
        }

        tracing::debug!(user=%username, "logged");
        Ok(user)
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    use argon2::{
        password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
        Argon2,
    };
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    Ok(argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("Argon2 error: {}", e))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    use argon2::{
        password_hash::{PasswordHash, PasswordVerifier},
        Argon2,
    };
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow!("Invalid hashed password: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}
