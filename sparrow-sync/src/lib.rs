pub mod dovecot;
pub mod postfix;
pub mod process;
pub mod sieve;
pub mod system;

// Everything outside the database that must follow it:
// - postfix virtual maps, rebuilt and reloaded (postfix)
// - the dovecot passwd file, one credential per mailbox (dovecot)
// - per mailbox sieve scripts in the vmail tree (sieve)
// `system` ties them to the account store.
