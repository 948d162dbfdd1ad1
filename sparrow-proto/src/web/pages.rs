use askama::Template;
use chrono::NaiveDateTime;

use sparrow_user::store::Account;

use super::error::FormError;

/// What every page shows around its content.
#[derive(Debug, Default)]
pub(crate) struct Chrome {
    pub flashes: Vec<String>,
    pub username: Option<String>,
}

/// Expiry as printed and as prefilled in datetime-local inputs.
pub(crate) fn show_date(date: &Option<NaiveDateTime>) -> String {
    date.map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

pub(crate) fn input_date(date: &Option<NaiveDateTime>) -> String {
    date.map(|d| d.format("%Y-%m-%dT%H:%M").to_string())
        .unwrap_or_default()
}

pub(crate) struct AccountRow {
    pub id: i64,
    pub address: String,
    pub expires: String,
}

impl From<&Account> for AccountRow {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id,
            address: a.address.clone(),
            expires: show_date(&a.expires_at),
        }
    }
}

pub(crate) struct MailboxRow {
    pub mailbox: AccountRow,
    pub aliases: Vec<AccountRow>,
}

pub(crate) struct FilterRow {
    pub id: i64,
    pub address: String,
    pub has_script: bool,
}

#[derive(Template)]
#[template(path = "welcome.html")]
pub(crate) struct WelcomePage {
    pub chrome: Chrome,
}

#[derive(Template)]
#[template(path = "notfound.html")]
pub(crate) struct NotFoundPage {
    pub chrome: Chrome,
}

#[derive(Template)]
#[template(path = "login.html")]
pub(crate) struct LoginPage {
    pub chrome: Chrome,
    pub errors: Vec<FormError>,
    pub redir: String,
    pub username: String,
}

#[derive(Template)]
#[template(path = "mails.html")]
pub(crate) struct MailsPage {
    pub chrome: Chrome,
    pub mailboxes: Vec<MailboxRow>,
}

#[derive(Template)]
#[template(path = "addmailbox.html")]
pub(crate) struct AddMailboxPage {
    pub chrome: Chrome,
    pub errors: Vec<FormError>,
    pub mailbox: String,
}

#[derive(Template)]
#[template(path = "addalias.html")]
pub(crate) struct AddAliasPage {
    pub chrome: Chrome,
    pub errors: Vec<FormError>,
    pub mailbox_id: i64,
    pub mailbox_address: String,
    pub alias: String,
}

#[derive(Template)]
#[template(path = "editmailbox.html")]
pub(crate) struct EditMailboxPage {
    pub chrome: Chrome,
    pub errors: Vec<FormError>,
    pub id: i64,
    pub mailbox: String,
    pub end_date: String,
    pub end_input: String,
}

#[derive(Template)]
#[template(path = "editalias.html")]
pub(crate) struct EditAliasPage {
    pub chrome: Chrome,
    pub errors: Vec<FormError>,
    pub id: i64,
    pub alias: String,
    pub target: String,
    pub end_date: String,
    pub end_input: String,
}

#[derive(Template)]
#[template(path = "delmail.html")]
pub(crate) struct DelMailPage {
    pub chrome: Chrome,
    pub errors: Vec<FormError>,
    pub id: i64,
    pub mail: String,
    pub is_alias: bool,
    pub aliases: Vec<String>,
}

#[derive(Template)]
#[template(path = "filters.html")]
pub(crate) struct FiltersPage {
    pub chrome: Chrome,
    pub mailboxes: Vec<FilterRow>,
}

#[derive(Template)]
#[template(path = "editfilter.html")]
pub(crate) struct EditFilterPage {
    pub chrome: Chrome,
    pub errors: Vec<FormError>,
    pub id: i64,
    pub mailbox: String,
    pub content: String,
}

#[derive(Template)]
#[template(path = "edituser.html")]
pub(crate) struct EditUserPage {
    pub chrome: Chrome,
    pub errors: Vec<FormError>,
    pub username: String,
}
