use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;

pub(crate) const COOKIE_NAME: &str = "sparrow_session";

/// Sessions not seen for this long are forgotten.
const IDLE_TIMEOUT: Duration = Duration::from_secs(12 * 3600);

struct Entry {
    user_id: Option<i64>,
    flashes: Vec<String>,
    last_seen: Instant,
}

/// Server side sessions. The browser only holds a random token.
/// Nothing survives a restart.
#[derive(Default)]
pub struct SessionStore {
    entries: Mutex<HashMap<String, Entry>>,
}

/// The session of one request. A token is only minted once something must
/// be remembered, the cookie is sent back when it is new.
#[derive(Debug, Default)]
pub(crate) struct Session {
    token: Option<String>,
    fresh: bool,
}

impl Session {
    /// `Set-Cookie` value to send when the token was minted by this request.
    pub(crate) fn set_cookie(&self, secure: bool) -> Option<String> {
        match (&self.token, self.fresh) {
            (Some(token), true) => Some(format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax{}",
                COOKIE_NAME,
                token,
                if secure { "; Secure" } else { "" }
            )),
            _ => None,
        }
    }
}

impl SessionStore {
    /// Resume the session named by the cookie, if it still exists.
    pub(crate) fn resume(&self, cookie: Option<String>) -> Session {
        let token = match cookie {
            Some(t) => t,
            None => return Session::default(),
        };
        let mut entries = self.lock();
        match entries.get_mut(&token) {
            Some(entry) if entry.last_seen.elapsed() < IDLE_TIMEOUT => {
                entry.last_seen = Instant::now();
                Session {
                    token: Some(token),
                    fresh: false,
                }
            }
            Some(_) => {
                entries.remove(&token);
                Session::default()
            }
            None => Session::default(),
        }
    }

    pub(crate) fn user_id(&self, session: &Session) -> Option<i64> {
        let token = session.token.as_ref()?;
        self.lock().get(token).and_then(|e| e.user_id)
    }

    /// Shown on the next rendered page.
    pub(crate) fn flash(&self, session: &mut Session, message: impl Into<String>) {
        let token = self.ensure(session);
        if let Some(entry) = self.lock().get_mut(&token) {
            entry.flashes.push(message.into());
        }
    }

    pub(crate) fn take_flashes(&self, session: &Session) -> Vec<String> {
        match &session.token {
            Some(token) => self
                .lock()
                .get_mut(token)
                .map(|e| std::mem::take(&mut e.flashes))
                .unwrap_or_default(),
            None => vec![],
        }
    }

    /// A new token is issued on login, pending flashes follow.
    pub(crate) fn log_in(&self, session: &mut Session, user_id: i64) {
        let flashes = self.discard(session);
        self.mint(session, Some(user_id), flashes);
    }

    pub(crate) fn log_out(&self, session: &mut Session) {
        let flashes = self.discard(session);
        self.mint(session, None, flashes);
    }

    fn ensure(&self, session: &mut Session) -> String {
        if let Some(token) = &session.token {
            if self.lock().contains_key(token) {
                return token.clone();
            }
        }
        self.mint(session, None, vec![])
    }

    fn discard(&self, session: &mut Session) -> Vec<String> {
        session
            .token
            .take()
            .and_then(|t| self.lock().remove(&t))
            .map(|e| e.flashes)
            .unwrap_or_default()
    }

    fn mint(&self, session: &mut Session, user_id: Option<i64>, flashes: Vec<String>) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);

        let mut entries = self.lock();
        entries.retain(|_, e| e.last_seen.elapsed() < IDLE_TIMEOUT);
        entries.insert(
            token.clone(),
            Entry {
                user_id,
                flashes,
                last_seen: Instant::now(),
            },
        );

        session.token = Some(token.clone());
        session.fresh = true;
        token
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // entries stay consistent even if a holder panicked
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_requests_do_not_create_sessions() {
        let store = SessionStore::default();
        let session = store.resume(None);
        assert_eq!(store.user_id(&session), None);
        assert!(store.take_flashes(&session).is_empty());
        assert_eq!(session.set_cookie(false), None);
        assert!(store.lock().is_empty());
    }

    #[test]
    fn flashes_are_shown_once() {
        let store = SessionStore::default();
        let mut session = store.resume(None);
        store.flash(&mut session, "You were already logged out");
        let cookie = session.set_cookie(false).unwrap();
        assert!(cookie.starts_with("sparrow_session="));
        assert!(cookie.contains("HttpOnly"));
        assert!(!cookie.contains("Secure"));

        let next = store.resume(session.token.clone());
        assert_eq!(next.set_cookie(false), None);
        assert_eq!(store.take_flashes(&next), vec!["You were already logged out"]);
        assert!(store.take_flashes(&next).is_empty());
    }

    #[test]
    fn login_rotates_the_token() {
        let store = SessionStore::default();
        let mut session = store.resume(None);
        store.flash(&mut session, "hello");
        let before = session.token.clone();

        store.log_in(&mut session, 7);
        assert_ne!(session.token, before);
        assert!(session.set_cookie(true).unwrap().ends_with("; Secure"));
        assert_eq!(store.user_id(&store.resume(before)), None);

        let resumed = store.resume(session.token.clone());
        assert_eq!(store.user_id(&resumed), Some(7));
        assert_eq!(store.take_flashes(&resumed), vec!["hello"]);

        store.log_out(&mut session);
        assert_eq!(store.user_id(&session), None);
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let store = SessionStore::default();
        let session = store.resume(Some("deadbeef".into()));
        assert_eq!(store.user_id(&session), None);
        assert_eq!(session.set_cookie(false), None);
    }
}
