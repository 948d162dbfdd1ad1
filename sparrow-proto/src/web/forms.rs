use std::str::FromStr;

use chrono::NaiveDateTime;
use email_address::EmailAddress;
use serde::Deserialize;

use super::error::FormError;

// Fields missing from a submission decode as empty strings, an empty field
// and an absent one mean the same thing.

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct AddMailboxForm {
    pub mailbox: String,
    pub password1: String,
    pub password2: String,
    #[serde(flatten)]
    pub expiry: ExpiryFields,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct AddAliasForm {
    pub alias: String,
    #[serde(flatten)]
    pub expiry: ExpiryFields,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct EditMailboxForm {
    pub old_password: String,
    pub new_password1: String,
    pub new_password2: String,
    #[serde(flatten)]
    pub expiry: ExpiryFields,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct EditAliasForm {
    pub old_password: String,
    #[serde(flatten)]
    pub expiry: ExpiryFields,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct DelMailForm {
    pub password: String,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct EditFilterForm {
    pub password: String,
    pub new_content: String,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct EditUserForm {
    pub old_password: String,
    pub username: String,
    pub new_password1: String,
    pub new_password2: String,
}

/// The `end` checkbox and the `end_date` datetime-local input.
#[derive(Deserialize, Default, Debug)]
#[serde(default)]
pub(crate) struct ExpiryFields {
    pub end: String,
    pub end_date: String,
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

impl ExpiryFields {
    pub fn enabled(&self) -> bool {
        !self.end.is_empty()
    }

    /// None when the box is unchecked. Dates are UTC.
    pub fn parse(&self) -> Result<Option<NaiveDateTime>, FormError> {
        if !self.enabled() {
            return Ok(None);
        }
        let raw = self.end_date.trim();
        if raw.is_empty() {
            return Err(FormError::missing("Please give the end date"));
        }
        DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(Some)
            .ok_or_else(FormError::tampered)
    }
}

/// Two password fields that must be filled and agree.
pub(crate) fn new_password<'a>(first: &'a str, second: &str) -> Result<&'a str, FormError> {
    if first.is_empty() || second.is_empty() {
        return Err(FormError::missing("Please fill in both password fields"));
    }
    if first != second {
        return Err(FormError::wrong("Passwords don't match"));
    }
    Ok(first)
}

/// Check that `input` is a usable mail address and normalize it:
/// surrounding blanks dropped, domain lowercased.
pub(crate) fn mail_address(input: &str) -> Result<String, FormError> {
    let invalid = || FormError::wrong(format!("{} is not a valid email", input));
    let input = input.trim();

    // passwd lines split on ':', postfix map lines on blanks
    if input.contains(|c: char| c == ':' || c.is_whitespace() || c.is_control()) {
        return Err(invalid());
    }

    let parsed = EmailAddress::from_str(input).map_err(|e| {
        tracing::debug!(address=%input, err=%e, "address rejected");
        invalid()
    })?;
    let domain = parsed.domain();
    // mail only goes to fully qualified domains
    if !domain.contains('.') || domain.split('.').any(str::is_empty) {
        return Err(invalid());
    }
    Ok(format!("{}@{}", parsed.local_part(), domain.to_lowercase()))
}
