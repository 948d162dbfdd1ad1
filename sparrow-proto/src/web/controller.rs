use std::collections::HashSet;

use anyhow::Result;
use askama::Template;
use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};

use sparrow_sync::sieve::Validation;
use sparrow_sync::system::MailSystem;
use sparrow_user::login::{hash_password, verify_password};
use sparrow_user::store::{Account, AdminUser};

use super::codec::{self, HttpResponse};
use super::error::{Category, FormError};
use super::forms::{
    mail_address, new_password, AddAliasForm, AddMailboxForm, DelMailForm, EditAliasForm,
    EditFilterForm, EditMailboxForm, EditUserForm, ExpiryFields, LoginForm,
};
use super::middleware::{Context, Page};
use super::pages::*;

pub(crate) struct Controller {
    ctx: Context,
}

impl Controller {
    pub(crate) async fn route(ctx: Context, req: Request<Incoming>) -> Result<HttpResponse> {
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let method = req.method().as_str().to_uppercase();

        let mut ctrl = Self { ctx };
        let resp = match (method.as_str(), segments.as_slice()) {
            ("GET", []) => ctrl.welcome(),
            ("GET", ["mails"]) => ctrl.mails().await,
            ("GET" | "POST", ["addmailbox"]) => ctrl.add_mailbox(req).await,
            ("GET" | "POST", ["addalias", id]) => match parse_id(id) {
                Some(id) => ctrl.add_alias(req, id).await,
                None => ctrl.not_found(),
            },
            ("GET" | "POST", ["editmailbox", id]) => match parse_id(id) {
                Some(id) => ctrl.edit_mailbox(req, id).await,
                None => ctrl.not_found(),
            },
            ("GET" | "POST", ["editalias", id]) => match parse_id(id) {
                Some(id) => ctrl.edit_alias(req, id).await,
                None => ctrl.not_found(),
            },
            ("GET" | "POST", ["delmail", id]) => match parse_id(id) {
                Some(id) => ctrl.del_mail(req, id).await,
                None => ctrl.not_found(),
            },
            ("GET", ["filters"]) => ctrl.filters().await,
            ("GET" | "POST", ["editfilter", id]) => match parse_id(id) {
                Some(id) => ctrl.edit_filter(req, id).await,
                None => ctrl.not_found(),
            },
            ("GET" | "POST", ["edituser"]) => ctrl.edit_user(req).await,
            ("GET" | "POST", ["login", redir]) => ctrl.login(req, redir).await,
            ("GET", ["logout"]) => ctrl.logout(),
            _ => ctrl.not_found(),
        }?;

        Ok(ctrl.ctx.finish(resp))
    }

    // --- pages ---

    fn welcome(&mut self) -> Result<HttpResponse> {
        self.render(WelcomePage {
            chrome: self.chrome(),
        })
    }

    fn not_found(&mut self) -> Result<HttpResponse> {
        let page = NotFoundPage {
            chrome: self.chrome(),
        };
        codec::html(StatusCode::NOT_FOUND, page.render()?)
    }

    async fn mails(&mut self) -> Result<HttpResponse> {
        let listing = self
            .system()
            .store
            .call(|db| {
                let mut listing = vec![];
                for mailbox in db.mailboxes()? {
                    let aliases = db.aliases_of(mailbox.id)?;
                    listing.push(MailboxRow {
                        mailbox: (&mailbox).into(),
                        aliases: aliases.iter().map(AccountRow::from).collect(),
                    });
                }
                Ok(listing)
            })
            .await?;

        self.render(MailsPage {
            chrome: self.chrome(),
            mailboxes: listing,
        })
    }

    async fn add_mailbox(&mut self, req: Request<Incoming>) -> Result<HttpResponse> {
        let mut errors = vec![];
        let mut typed = String::new();

        if req.method() == Method::POST {
            match codec::read_form::<AddMailboxForm>(req).await {
                Err(e) => errors.push(e),
                Ok(form) => {
                    typed = form.mailbox.clone();
                    match self.create_mailbox(&form).await {
                        Ok(address) => {
                            self.ctx.flash(format!(
                                "{} has been successfully added as a mailbox",
                                address
                            ));
                            return codec::redirect(Page::Mails.path());
                        }
                        Err(e) => errors.push(e),
                    }
                }
            }
        }

        self.render(AddMailboxPage {
            chrome: self.chrome(),
            errors,
            mailbox: typed,
        })
    }

    async fn add_alias(&mut self, req: Request<Incoming>, mailbox_id: i64) -> Result<HttpResponse> {
        let mailbox = match self.find(mailbox_id).await? {
            Some(m) if m.is_mailbox() => m,
            _ => {
                self.ctx
                    .flash("The mailbox you've asked to add an alias to doesn't exist");
                return codec::redirect(Page::Mails.path());
            }
        };

        let mut errors = vec![];
        let mut typed = String::new();
        if req.method() == Method::POST {
            match codec::read_form::<AddAliasForm>(req).await {
                Err(e) => errors.push(e),
                Ok(form) => {
                    typed = form.alias.clone();
                    match self.create_alias(&form, &mailbox).await {
                        Ok(alias) => {
                            self.ctx.flash(format!(
                                "{} has been successfully added as an alias",
                                alias
                            ));
                            return codec::redirect(Page::Mails.path());
                        }
                        Err(e) => errors.push(e),
                    }
                }
            }
        }

        self.render(AddAliasPage {
            chrome: self.chrome(),
            errors,
            mailbox_id,
            mailbox_address: mailbox.address,
            alias: typed,
        })
    }

    async fn edit_mailbox(&mut self, req: Request<Incoming>, id: i64) -> Result<HttpResponse> {
        let mailbox = match self.find(id).await? {
            Some(m) if m.is_mailbox() => m,
            _ => {
                self.ctx
                    .flash("The mailbox asked to be edited doesn't exist or is not a mailbox");
                return codec::redirect(Page::Mails.path());
            }
        };

        let mut errors = vec![];
        if req.method() == Method::POST {
            match codec::read_form::<EditMailboxForm>(req).await {
                Err(e) => errors.push(e),
                Ok(form) => {
                    if let Err(e) = self.modify_mailbox(&form, &mailbox).await {
                        errors.push(e);
                    }
                }
            }
        }

        let mailbox = self.find(id).await?.unwrap_or(mailbox);
        self.render(EditMailboxPage {
            chrome: self.chrome(),
            errors,
            id,
            end_date: show_date(&mailbox.expires_at),
            end_input: input_date(&mailbox.expires_at),
            mailbox: mailbox.address,
        })
    }

    async fn edit_alias(&mut self, req: Request<Incoming>, id: i64) -> Result<HttpResponse> {
        let alias = match self.find(id).await? {
            Some(a) if a.is_alias() => a,
            _ => {
                self.ctx
                    .flash("The alias asked to be edited doesn't exist or is not an alias");
                return codec::redirect(Page::Mails.path());
            }
        };
        let target = self.owner(&alias).await?;

        let mut errors = vec![];
        if req.method() == Method::POST {
            match codec::read_form::<EditAliasForm>(req).await {
                Err(e) => errors.push(e),
                Ok(form) => {
                    let outcome = match &target {
                        None => Err(corrupted()),
                        Some(t) => {
                            match self.confirm(&t.address, &form.old_password, must_confirm()).await {
                                Ok(()) => self.update_expiry(&alias, &form.expiry).await,
                                Err(e) => Err(e),
                            }
                        }
                    };
                    if let Err(e) = outcome {
                        errors.push(e);
                    }
                }
            }
        }

        let alias = self.find(id).await?.unwrap_or(alias);
        self.render(EditAliasPage {
            chrome: self.chrome(),
            errors,
            id,
            target: target.map(|t| t.address).unwrap_or_default(),
            end_date: show_date(&alias.expires_at),
            end_input: input_date(&alias.expires_at),
            alias: alias.address,
        })
    }

    async fn del_mail(&mut self, req: Request<Incoming>, id: i64) -> Result<HttpResponse> {
        let mail = match self.find(id).await? {
            Some(m) => m,
            None => {
                self.ctx.flash("The mail asked to be deleted doesn't exist");
                return codec::redirect(Page::Mails.path());
            }
        };
        let owner = self.owner(&mail).await?;

        let mut errors = vec![];
        if req.method() == Method::POST {
            match codec::read_form::<DelMailForm>(req).await {
                Err(e) => errors.push(e),
                Ok(form) => match self.delete_account(&form, &mail, owner.as_ref()).await {
                    Ok(()) => return codec::redirect(Page::Mails.path()),
                    Err(e) => errors.push(e),
                },
            }
        }

        let aliases: Vec<String> = match mail.is_mailbox() {
            true => self
                .system()
                .store
                .call(move |db| db.aliases_of(id))
                .await?
                .into_iter()
                .map(|a| a.address)
                .collect(),
            false => vec![],
        };
        self.render(DelMailPage {
            chrome: self.chrome(),
            errors,
            id,
            is_alias: mail.is_alias(),
            mail: mail.address,
            aliases,
        })
    }

    async fn filters(&mut self) -> Result<HttpResponse> {
        let mailboxes = self.system().store.call(|db| db.mailboxes()).await?;

        let mut scripts = HashSet::new();
        match self.system().sieve.list().await {
            Ok(found) => {
                for (address, path) in found {
                    if tokio::fs::metadata(&path).await.is_ok() {
                        scripts.insert(address);
                    }
                }
            }
            Err(e) => tracing::warn!(err=?e, "unable to walk the vmail tree"),
        }

        let rows = mailboxes
            .into_iter()
            .map(|m| FilterRow {
                id: m.id,
                has_script: scripts.contains(&m.address),
                address: m.address,
            })
            .collect();
        self.render(FiltersPage {
            chrome: self.chrome(),
            mailboxes: rows,
        })
    }

    async fn edit_filter(&mut self, req: Request<Incoming>, id: i64) -> Result<HttpResponse> {
        let mailbox = match self.find(id).await? {
            Some(m) if m.is_mailbox() => m,
            _ => {
                self.ctx
                    .flash("The filter you've asked for is not associated with a mailbox");
                return codec::redirect(Page::Filters.path());
            }
        };

        let mut errors = vec![];
        let mut posted = None;
        if req.method() == Method::POST {
            match codec::read_form::<EditFilterForm>(req).await {
                Err(e) => errors.push(e),
                Ok(form) => {
                    let outcome = self.replace_filter(&form, &mailbox).await;
                    match outcome {
                        Ok(()) => {
                            self.ctx.flash("New sieve file successfully written");
                            return codec::redirect(Page::Filters.path());
                        }
                        Err(e) => {
                            errors.extend(e);
                            posted = Some(form.new_content);
                        }
                    }
                }
            }
        }

        let content = match posted {
            Some(c) => c,
            None => match self.system().sieve.read(&mailbox.address).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(err=?e, "unable to read sieve script");
                    errors.push(FormError::new(
                        Category::SieveManip,
                        "Something went wrong while reading the sieve file. Check the logs for more details.",
                    ));
                    String::new()
                }
            },
        };

        self.render(EditFilterPage {
            chrome: self.chrome(),
            errors,
            id,
            mailbox: mailbox.address,
            content,
        })
    }

    async fn edit_user(&mut self, req: Request<Incoming>) -> Result<HttpResponse> {
        let user = match self.ctx.user.clone() {
            Some(u) => u,
            None => return codec::redirect(&format!("/login/{}", Page::EditUser.name())),
        };

        let mut errors = vec![];
        if req.method() == Method::POST {
            match codec::read_form::<EditUserForm>(req).await {
                Err(e) => errors.push(e),
                Ok(form) => errors.extend(self.modify_user(&form, &user).await),
            }
        }

        let user_id = user.id;
        let username = self
            .system()
            .store
            .call(move |db| db.user(user_id))
            .await?
            .map(|u| u.username)
            .unwrap_or(user.username);
        self.render(EditUserPage {
            chrome: self.chrome(),
            errors,
            username,
        })
    }

    async fn login(&mut self, req: Request<Incoming>, redir: &str) -> Result<HttpResponse> {
        let mut errors = vec![];
        let mut typed = String::new();

        if req.method() == Method::POST {
            match codec::read_form::<LoginForm>(req).await {
                Err(e) => errors.push(e),
                Ok(form) if form.username.is_empty() || form.password.is_empty() => {
                    typed = form.username;
                    errors.push(FormError::missing("No credentials given"));
                }
                Ok(form) => {
                    let outcome = self.ctx.app.login.login(&form.username, &form.password).await;
                    match outcome {
                        Ok(user) => {
                            tracing::info!(user=%user.username, "operator logged in");
                            self.ctx.app.sessions.log_in(&mut self.ctx.session, user.id);
                            self.ctx.user = Some(user);
                            self.ctx.flash("Successfully connected");

                            let target = match Page::from_name(redir) {
                                Some(page) => page,
                                None => {
                                    self.ctx.flash("A wrong URL was given so you've been redirected to the welcome page");
                                    Page::Welcome
                                }
                            };
                            return codec::redirect(target.path());
                        }
                        Err(e) => {
                            tracing::info!(user=%form.username, err=%e, "login refused");
                            typed = form.username;
                            errors.push(FormError::wrong("Incorrect credentials"));
                        }
                    }
                }
            }
        }

        self.render(LoginPage {
            chrome: self.chrome(),
            errors,
            redir: redir.to_string(),
            username: typed,
        })
    }

    fn logout(&mut self) -> Result<HttpResponse> {
        match self.ctx.user.take() {
            None => self.ctx.flash("You were already logged out"),
            Some(user) => {
                self.ctx.app.sessions.log_out(&mut self.ctx.session);
                tracing::info!(user=%user.username, "operator logged out");
                self.ctx.flash("You successfully logged out");
            }
        }
        codec::redirect(Page::Welcome.path())
    }

    // --- actions ---

    async fn create_mailbox(&self, form: &AddMailboxForm) -> Result<String, FormError> {
        if form.mailbox.is_empty() {
            return Err(FormError::missing("The mailbox field can't be empty"));
        }
        let password = new_password(&form.password1, &form.password2)?;
        let expires_at = form.expiry.parse()?;
        let address = mail_address(&form.mailbox)?;

        let addr = address.clone();
        self.system()
            .store
            .call(move |db| db.add_mailbox(&addr, expires_at))
            .await?;
        self.system().refresh().await?;
        self.system()
            .passwd
            .add(&address, password)
            .await
            .map_err(|e| {
                tracing::error!(err=?e, address=%address, "unable to store credential");
                FormError::new(
                    Category::DovecotManip,
                    "Something went wrong while setting the password. Check the logs for more details.",
                )
            })?;

        tracing::info!(address=%address, "mailbox added");
        Ok(address)
    }

    async fn create_alias(&self, form: &AddAliasForm, mailbox: &Account) -> Result<String, FormError> {
        if form.alias.is_empty() {
            return Err(FormError::missing("The alias field can't be empty"));
        }
        let expires_at = form.expiry.parse()?;
        let alias = mail_address(&form.alias)?;

        let (addr, target) = (alias.clone(), mailbox.id);
        self.system()
            .store
            .call(move |db| db.add_alias(&addr, target, expires_at))
            .await?;
        self.system().refresh().await?;

        tracing::info!(alias=%alias, mailbox=%mailbox.address, "alias added");
        Ok(alias)
    }

    async fn modify_mailbox(&mut self, form: &EditMailboxForm, mailbox: &Account) -> Result<(), FormError> {
        self.confirm(&mailbox.address, &form.old_password, must_confirm())
            .await?;

        let mut outcome = Ok(());
        if !form.new_password1.is_empty() || !form.new_password2.is_empty() {
            outcome = self.change_password(form, mailbox).await;
        }
        let expiry = self.update_expiry(mailbox, &form.expiry).await;
        outcome.and(expiry)
    }

    async fn change_password(&mut self, form: &EditMailboxForm, mailbox: &Account) -> Result<(), FormError> {
        let password = new_password(&form.new_password1, &form.new_password2)?;
        let failed = || {
            FormError::new(
                Category::DovecotManip,
                "Something went wrong while changing the password. Check the logs for more details.",
            )
        };
        match self.system().passwd.change(&mailbox.address, password).await {
            Ok(true) => {
                tracing::info!(address=%mailbox.address, "mailbox password changed");
                self.ctx.flash(format!(
                    "The password for {} has been successfully changed",
                    mailbox.address
                ));
                Ok(())
            }
            Ok(false) => {
                tracing::error!(address=%mailbox.address, "mailbox has no credential entry");
                Err(failed())
            }
            Err(e) => {
                tracing::error!(err=?e, address=%mailbox.address, "unable to change credential");
                Err(failed())
            }
        }
    }

    /// Set the expiry when asked to, remove an existing one when unchecked.
    async fn update_expiry(&mut self, account: &Account, fields: &ExpiryFields) -> Result<(), FormError> {
        if !fields.enabled() && account.expires_at.is_none() {
            return Ok(());
        }
        let expires_at = fields.parse()?;

        let id = account.id;
        self.system()
            .store
            .call(move |db| db.set_expiry(id, expires_at))
            .await?;

        match expires_at {
            Some(date) => {
                tracing::info!(address=%account.address, end=%date, "end limit set");
                self.ctx.flash(format!(
                    "End limit for {} changed to {}",
                    account.address,
                    show_date(&Some(date))
                ));
            }
            None => {
                tracing::info!(address=%account.address, "end limit removed");
                self.ctx
                    .flash(format!("Removed end limit for {}", account.address));
            }
        }
        Ok(())
    }

    async fn delete_account(
        &mut self,
        form: &DelMailForm,
        mail: &Account,
        owner: Option<&Account>,
    ) -> Result<(), FormError> {
        let owner = owner.ok_or_else(corrupted)?;
        self.confirm(
            &owner.address,
            &form.password,
            FormError::missing("Please fill the password field"),
        )
        .await?;

        let id = mail.id;
        let removed = self
            .system()
            .store
            .call(move |db| db.delete_account(id))
            .await?;
        for account in removed.iter() {
            tracing::info!(address=%account.address, "account deleted");
        }
        self.ctx.flash(match mail.is_alias() {
            true => "Alias successfully deleted",
            false => "Mailbox successfully deleted",
        });

        if let Err(e) = self.system().refresh().await {
            let e: FormError = e.into();
            self.ctx.flash(e.to_string());
        }
        Ok(())
    }

    async fn replace_filter(&self, form: &EditFilterForm, mailbox: &Account) -> Result<(), Vec<FormError>> {
        self.confirm(
            &mailbox.address,
            &form.password,
            FormError::missing("No password given"),
        )
        .await
        .map_err(|e| vec![e])?;

        match self.system().sieve.validate(&form.new_content).await {
            Ok(Validation::Valid) => (),
            Ok(Validation::Invalid(lines)) => {
                return Err(lines
                    .into_iter()
                    .map(|l| FormError::new(Category::SieveSyntax, l))
                    .collect())
            }
            Err(e) => {
                tracing::error!(err=?e, "unable to validate sieve script");
                return Err(vec![FormError::new(
                    Category::SieveManip,
                    "Something went wrong while checking the sieve file. Check the logs for more details.",
                )]);
            }
        }

        self.system()
            .sieve
            .write(&mailbox.address, &form.new_content)
            .await
            .map_err(|e| {
                tracing::error!(err=?e, address=%mailbox.address, "unable to write sieve script");
                vec![FormError::new(
                    Category::SieveManip,
                    "Something went wrong while writing the new sieve file. Check the logs for more details.",
                )]
            })
    }

    /// Every requested change is attempted, all failures are reported.
    async fn modify_user(&mut self, form: &EditUserForm, user: &AdminUser) -> Vec<FormError> {
        if form.old_password.is_empty() {
            return vec![FormError::missing("No password given")];
        }
        match verify_password(&form.old_password, &user.password) {
            Ok(true) => (),
            Ok(false) => return vec![FormError::wrong("Wrong password")],
            Err(e) => {
                tracing::error!(err=?e, user=%user.username, "stored operator hash is unreadable");
                return vec![FormError::wrong("Wrong password")];
            }
        }

        let mut errors = vec![];
        let user_id = user.id;

        if !form.username.is_empty() && form.username != user.username {
            let username = form.username.clone();
            match self
                .system()
                .store
                .call(move |db| db.rename_user(user_id, &username))
                .await
            {
                Ok(()) => {
                    tracing::info!(from=%user.username, to=%form.username, "operator renamed");
                    self.ctx.flash(format!(
                        "Your username has successfully been changed to {}",
                        form.username
                    ));
                }
                Err(e) => errors.push(e.into()),
            }
        }

        if !form.new_password1.is_empty() || !form.new_password2.is_empty() {
            match new_password(&form.new_password1, &form.new_password2) {
                Err(e) => errors.push(e),
                Ok(password) => match hash_password(password) {
                    Err(e) => {
                        tracing::error!(err=?e, "unable to hash operator password");
                        errors.push(FormError::new(
                            Category::Unknown,
                            "Something went wrong while changing your password",
                        ));
                    }
                    Ok(hash) => match self
                        .system()
                        .store
                        .call(move |db| db.set_user_password(user_id, &hash))
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(user=%user.username, "operator password changed");
                            self.ctx.flash("Your password has been successfully modified");
                        }
                        Err(e) => errors.push(e.into()),
                    },
                },
            }
        }

        errors
    }

    // --- helpers ---

    fn system(&self) -> &MailSystem {
        &self.ctx.app.system
    }

    fn chrome(&self) -> Chrome {
        Chrome {
            flashes: self.ctx.app.sessions.take_flashes(&self.ctx.session),
            username: self.ctx.user.as_ref().map(|u| u.username.clone()),
        }
    }

    fn render(&self, page: impl Template) -> Result<HttpResponse> {
        codec::html(StatusCode::OK, page.render()?)
    }

    async fn find(&self, id: i64) -> Result<Option<Account>> {
        Ok(self.system().store.call(move |db| db.account(id)).await?)
    }

    /// The mailbox whose password guards `account`.
    async fn owner(&self, account: &Account) -> Result<Option<Account>> {
        match account.target_id {
            None => Ok(Some(account.clone())),
            Some(target) => Ok(self.find(target).await?.filter(Account::is_mailbox)),
        }
    }

    /// Mailbox level operations need the password of that mailbox.
    async fn confirm(&self, address: &str, password: &str, missing: FormError) -> Result<(), FormError> {
        if password.is_empty() {
            return Err(missing);
        }
        match self.system().passwd.check(address, password).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::info!(address=%address, "wrong mailbox password");
                Err(FormError::wrong("Wrong password"))
            }
            Err(e) => {
                tracing::error!(err=?e, address=%address, "unable to check credential");
                Err(FormError::new(
                    Category::DovecotManip,
                    "Something went wrong while checking the password. Check the logs for more details.",
                ))
            }
        }
    }
}

fn parse_id(raw: &str) -> Option<i64> {
    raw.parse().ok()
}

fn must_confirm() -> FormError {
    FormError::new(
        Category::ConfPasswd,
        "You must fill in the password field to be able to modify anything",
    )
}

fn corrupted() -> FormError {
    FormError::new(
        Category::DbManip,
        "The associated mailbox could not be retrieved, the database may be corrupted",
    )
}
