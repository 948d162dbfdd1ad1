use std::sync::Arc;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, SET_COOKIE};
use hyper::Request;

use sparrow_user::store::AdminUser;

use super::codec::{self, HttpResponse};
use super::session::{Session, COOKIE_NAME};
use super::WebApp;

/// Pages a login can send back to, by the name used in `/login/<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Page {
    Welcome,
    Mails,
    Filters,
    EditUser,
}

impl Page {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "welcome" => Some(Self::Welcome),
            "mails" => Some(Self::Mails),
            "filters" => Some(Self::Filters),
            "edit_user" => Some(Self::EditUser),
            _ => None,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Mails => "mails",
            Self::Filters => "filters",
            Self::EditUser => "edit_user",
        }
    }

    pub(crate) fn path(&self) -> &'static str {
        match self {
            Self::Welcome => "/",
            Self::Mails => "/mails/",
            Self::Filters => "/filters/",
            Self::EditUser => "/edituser",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Access {
    Public,
    /// Operators only, others log in first and come back to this page.
    Protected(Page),
}

fn access(path: &str) -> Access {
    let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
    match first {
        "mails" | "addmailbox" | "addalias" | "editmailbox" | "editalias" | "delmail" => {
            Access::Protected(Page::Mails)
        }
        "filters" | "editfilter" => Access::Protected(Page::Filters),
        "edituser" => Access::Protected(Page::EditUser),
        _ => Access::Public,
    }
}

/// Request scoped state handed to the controller.
pub(crate) struct Context {
    pub app: Arc<WebApp>,
    pub session: Session,
    pub user: Option<AdminUser>,
}

impl Context {
    pub(crate) fn flash(&mut self, message: impl Into<String>) {
        self.app.sessions.flash(&mut self.session, message);
    }

    /// Attach the session cookie when this request created the session.
    pub(crate) fn finish(&self, mut resp: HttpResponse) -> HttpResponse {
        if let Some(cookie) = self.session.set_cookie(self.app.secure_cookie) {
            match HeaderValue::from_str(&cookie) {
                Ok(hv) => {
                    resp.headers_mut().append(SET_COOKIE, hv);
                }
                Err(e) => tracing::error!(err=?e, "invalid session cookie"),
            }
        }
        resp
    }
}

pub(super) async fn auth<'a>(
    app: Arc<WebApp>,
    req: Request<Incoming>,
    next: impl Fn(Context, Request<Incoming>) -> futures::future::BoxFuture<'a, Result<HttpResponse>>,
) -> Result<HttpResponse> {
    let mut session = app.sessions.resume(codec::cookie(&req, COOKIE_NAME));

    let user = match app.sessions.user_id(&session) {
        None => None,
        Some(id) => match app.system.store.call(move |db| db.user(id)).await? {
            Some(u) => Some(u),
            None => {
                tracing::warn!(user_id = id, "session of a deleted operator");
                app.sessions.log_out(&mut session);
                app.sessions.flash(
                    &mut session,
                    "It seems your session was linked to an account that does not exist anymore",
                );
                None
            }
        },
    };

    let ctx = Context { app, session, user };

    if let Access::Protected(page) = access(req.uri().path()) {
        if ctx.user.is_none() {
            tracing::debug!(path=%req.uri().path(), "not logged in");
            let resp = codec::redirect(&format!("/login/{}", page.name()))?;
            return Ok(ctx.finish(resp));
        }
    }

    next(ctx, req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_pages() {
        assert_eq!(access("/"), Access::Public);
        assert_eq!(access("/login/mails"), Access::Public);
        assert_eq!(access("/logout"), Access::Public);
        assert_eq!(access("/mails/"), Access::Protected(Page::Mails));
        assert_eq!(access("/delmail/3"), Access::Protected(Page::Mails));
        assert_eq!(access("/editfilter/3"), Access::Protected(Page::Filters));
        assert_eq!(access("/edituser"), Access::Protected(Page::EditUser));
    }

    #[test]
    fn page_names_round_trip() {
        for page in [Page::Welcome, Page::Mails, Page::Filters, Page::EditUser] {
            assert_eq!(Page::from_name(page.name()), Some(page));
        }
        assert_eq!(Page::from_name("http://evil.example"), None);
    }
}
