use std::time;

pub static SMALL_DELAY: time::Duration = time::Duration::from_millis(200);

pub static WEB_ADDR: &str = "[::1]:5000";
pub static BASE_URL: &str = "http://[::1]:5000";

pub static ADMIN_USERNAME: &str = "alice";
pub static ADMIN_PASSWORD: &str = "hunter2";

pub static MAILBOX_PASSWORD: &str = "correct horse battery staple";
pub static MAILBOX_NEW_PASSWORD: &str = "Tr0ub4dor&3";
