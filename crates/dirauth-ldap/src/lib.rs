//! Directory (LDAP) authentication for web applications.
//!
//! [`DirectoryAuthenticator`] looks users up with a privileged search account and verifies their
//! credentials by binding as them, optionally requiring membership in a `groupOfUniqueNames`
//! group. The wire protocol is handled by `ldap3` behind the [`DirectoryClient`] capability, so
//! any other implementation (or a test double) can be plugged in.

#![deny(missing_docs)]

mod authenticator;
mod client;
mod config;
mod dn;
pub mod filter;

pub use authenticator::{ConnectionState, DirectoryAuthenticator};
pub use client::{
    ConnectionOption, DirectoryClient, DirectoryConnection, DirectoryEntry, LdapClient,
};
pub use config::{
    DirectoryConfig, GroupMatch, UserBindMode, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_OPERATION_TIMEOUT_SECS, DEFAULT_PROTOCOL_VERSION,
};
pub use dn::{DistinguishedName, DistinguishedNameError, RelativeDistinguishedName};

/// Convenient result alias that reuses the core error type.
pub type Result<T> = dirauth_core::Result<T>;

pub use dirauth_core::Error;
