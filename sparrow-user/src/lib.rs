pub mod config;
pub mod login;
pub mod store;

// What SparrowMail knows about people:
// - mail accounts (mailboxes and their aliases) in the store
// - operators allowed on the web front-end (login)
// - where the mail system expects its files (config)
