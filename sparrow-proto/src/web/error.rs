use std::fmt;

use sparrow_sync::system::RefreshError;
use sparrow_user::store::StoreError;

/// What went wrong with a form, as told to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    MissingArg,
    WrongArg,
    DbManip,
    SieveManip,
    SieveSyntax,
    DovecotManip,
    PostfixManip,
    ConfPasswd,
    Hacker,
    Unknown,
}

impl Category {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MissingArg => "Missing argument",
            Self::WrongArg => "Wrong argument",
            Self::DbManip => "Database manipulation",
            Self::SieveManip => "Sieve file manipulation",
            Self::SieveSyntax => "Sieve syntax",
            Self::DovecotManip => "Dovecot file manipulation",
            Self::PostfixManip => "Postfix file manipulation",
            Self::ConfPasswd => "Confirmation password",
            Self::Hacker => "R U H4ck3r ?",
            Self::Unknown => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormError {
    pub category: Category,
    pub message: String,
}

impl FormError {
    pub fn new(category: Category, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn missing(message: impl Into<String>) -> Self {
        Self::new(Category::MissingArg, message)
    }

    pub fn wrong(message: impl Into<String>) -> Self {
        Self::new(Category::WrongArg, message)
    }

    pub fn tampered() -> Self {
        Self::new(
            Category::Hacker,
            "Please don't even try to mess up with the form",
        )
    }

    pub fn heading(&self) -> String {
        match self.category.name() {
            "" => "Error".to_string(),
            name => format!("Error ({})", name),
        }
    }
}

impl fmt::Display for FormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.heading(), self.message)
    }
}

/// The cause is logged, the operator only learns which part failed.
impl From<StoreError> for FormError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AddressTaken(_) => {
                Self::wrong("This mail address is already used, try another one")
            }
            StoreError::UsernameTaken(_) => {
                Self::wrong("This username is already used, try another one")
            }
            other => {
                tracing::error!(err=?other, "database failure");
                Self::new(
                    Category::DbManip,
                    "Something went wrong while updating the database",
                )
            }
        }
    }
}

impl From<RefreshError> for FormError {
    fn from(e: RefreshError) -> Self {
        tracing::error!(err=?e, "mail system refresh failed");
        match e {
            RefreshError::Store(s) => s.into(),
            RefreshError::Postfix(_) => Self::new(
                Category::PostfixManip,
                "Something went wrong while updating postfix. Check the logs for more details.",
            ),
            RefreshError::Dovecot(_) => Self::new(
                Category::DovecotManip,
                "Something went wrong while updating the password file. Check the logs for more details.",
            ),
        }
    }
}
