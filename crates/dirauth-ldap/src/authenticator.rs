//! Directory lookup and credential verification.
//!
//! [`DirectoryAuthenticator`] owns a single lookup connection. It is opened lazily on the first
//! operation, bound as the configured search user and reused for the lifetime of the instance.
//! Every operation takes `&mut self`; share an instance between tasks only behind a lock.

use crate::client::{
    ConnectionOption, DirectoryClient, DirectoryConnection, DirectoryEntry, LdapClient,
};
use crate::config::{DirectoryConfig, GroupMatch, UserBindMode};
use crate::dn::DistinguishedName;
use crate::filter;
use dirauth_core::{Error, Result};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle of the lookup connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection handle.
    Disconnected,
    /// Connection open and configured, search user not (or no longer) bound.
    Connected,
    /// Connection bound as the search user.
    Bound,
}

/// Authenticates end users against a directory.
pub struct DirectoryAuthenticator {
    config: Arc<DirectoryConfig>,
    client: Box<dyn DirectoryClient>,
    connection: Option<Box<dyn DirectoryConnection>>,
    bound: bool,
}

impl DirectoryAuthenticator {
    /// Creates an authenticator that talks to the directory through `ldap3`.
    ///
    /// No connection is made until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` fails [`DirectoryConfig::check`].
    pub fn new(config: DirectoryConfig) -> Result<Self> {
        config.check()?;
        let config = Arc::new(config);
        let client: Box<dyn DirectoryClient> = Box::new(LdapClient::new(config.clone()));
        Ok(Self::from_parts(config, client))
    }

    /// Creates an authenticator with a custom directory client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` fails [`DirectoryConfig::check`].
    pub fn with_client(
        config: DirectoryConfig,
        client: Box<dyn DirectoryClient>,
    ) -> Result<Self> {
        config.check()?;
        Ok(Self::from_parts(Arc::new(config), client))
    }

    fn from_parts(config: Arc<DirectoryConfig>, client: Box<dyn DirectoryClient>) -> Self {
        Self {
            config,
            client,
            connection: None,
            bound: false,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Returns the state of the lookup connection.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        match (&self.connection, self.bound) {
            (None, _) => ConnectionState::Disconnected,
            (Some(_), false) => ConnectionState::Connected,
            (Some(_), true) => ConnectionState::Bound,
        }
    }

    /// Returns true if a lookup connection is open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Looks up the entry whose login attribute equals `uid`.
    ///
    /// Returns `Ok(None)` when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] or [`Error::Bind`] if the lookup connection cannot be
    /// established, and [`Error::Search`] or [`Error::Timeout`] if the search fails.
    pub async fn search_uid(&mut self, uid: &str) -> Result<Option<DirectoryEntry>> {
        let filter = filter::equality_filter(
            self.config.object_class(),
            self.config.login_attribute(),
            uid,
            self.config.escape_filter_values(),
        );
        let base_dn = self.config.base_dn().as_str().to_owned();
        let connection = self
            .get_connection()
            .await
            .map_err(|err| report("user lookup", err))?;
        debug!(base_dn = %base_dn, filter = %filter, "looking up user");
        let entries = connection
            .search(&base_dn, &filter)
            .await
            .map_err(|err| report("user lookup", err))?;
        Ok(entries.into_iter().next())
    }

    /// Verifies the credentials of `dn` and, when `group` is given, its membership in that group.
    ///
    /// Rejected credentials and missing membership are `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the directory cannot answer: connection, privileged bind,
    /// search or timeout failures.
    pub async fn authenticate(
        &mut self,
        dn: &str,
        password: &str,
        group: Option<&str>,
    ) -> Result<bool> {
        // An empty password would be an unauthenticated bind, which servers accept.
        if password.is_empty() {
            debug!(dn, "rejecting empty password");
            return Ok(false);
        }

        let accepted = match self.config.user_bind_mode() {
            UserBindMode::Dedicated => self.bind_dedicated(dn, password).await,
            UserBindMode::Shared => self.bind_shared(dn, password).await,
        }
        .map_err(|err| report("user bind", err))?;
        if !accepted {
            return Ok(false);
        }

        let authorized = match group {
            None => true,
            Some(group) => self
                .is_user_in_group(dn, group)
                .await
                .map_err(|err| report("group check", err))?,
        };
        if authorized {
            info!(dn, group, "user authenticated");
        } else {
            debug!(dn, group, "user is not a member of the required group");
        }
        Ok(authorized)
    }

    /// Closes the lookup connection. The next operation reconnects.
    pub async fn disconnect(&mut self) {
        self.bound = false;
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.unbind().await {
                warn!(error = %err, "failed to unbind lookup connection");
            }
        }
    }

    async fn get_connection(&mut self) -> Result<&mut dyn DirectoryConnection> {
        self.connect().await?;
        match self.connection.as_deref_mut() {
            Some(connection) => Ok(connection),
            None => Err(Error::connection("lookup connection is not open")),
        }
    }

    /// Opens the lookup connection if needed and binds the search user if it is not bound.
    async fn connect(&mut self) -> Result<()> {
        if self.connection.is_none() {
            self.connection = Some(open_configured(self.client.as_ref(), &self.config).await?);
            self.bound = false;
        }
        if self.bound {
            return Ok(());
        }

        let config = self.config.clone();
        let Some(connection) = self.connection.as_deref_mut() else {
            return Err(Error::connection("lookup connection is not open"));
        };
        debug!(user = config.search_user_name(), "binding search user");
        connection
            .bind(
                config.search_user_name(),
                config.search_user_password().expose_secret(),
            )
            .await?;
        self.bound = true;
        Ok(())
    }

    async fn bind_dedicated(&mut self, dn: &str, password: &str) -> Result<bool> {
        let mut connection = open_configured(self.client.as_ref(), &self.config).await?;
        let result = user_bind(connection.as_mut(), dn, password).await;
        if let Err(err) = connection.unbind().await {
            warn!(error = %err, "failed to unbind user connection");
        }
        result
    }

    async fn bind_shared(&mut self, dn: &str, password: &str) -> Result<bool> {
        let connection = self.get_connection().await?;
        let result = user_bind(connection, dn, password).await;
        // The handle no longer carries the search user's identity, whatever the outcome.
        self.bound = false;
        result
    }

    async fn is_user_in_group(&mut self, dn: &str, group: &str) -> Result<bool> {
        let filter = filter::group_membership_filter(dn, self.config.escape_filter_values());
        let base_dn = self.config.base_dn().as_str().to_owned();
        let group_match = self.config.group_match();
        let connection = self.get_connection().await?;
        let groups = connection.search(&base_dn, &filter).await?;

        Ok(groups
            .iter()
            .rev()
            .any(|entry| group_matches(group_match, &entry.dn, group)))
    }
}

async fn open_configured(
    client: &dyn DirectoryClient,
    config: &DirectoryConfig,
) -> Result<Box<dyn DirectoryConnection>> {
    let mut connection = client.open(config.uri()).await?;
    let options = [
        ConnectionOption::ProtocolVersion(config.protocol_version()),
        ConnectionOption::FollowReferrals(config.follow_referrals()),
        ConnectionOption::NetworkTimeout(config.connect_timeout()),
        ConnectionOption::OperationTimeLimit(config.operation_timeout()),
    ];
    for option in options {
        connection.set_option(option)?;
    }
    Ok(connection)
}

async fn user_bind(
    connection: &mut dyn DirectoryConnection,
    dn: &str,
    password: &str,
) -> Result<bool> {
    match connection.bind(dn, password).await {
        Ok(()) => Ok(true),
        Err(Error::Bind { code, message }) => {
            debug!(dn, code, message = %message, "user bind rejected");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Logs a failed operation at a level matching the error's severity.
fn report(operation: &'static str, err: Error) -> Error {
    if err.should_log() {
        error!(operation, error = %err, "directory operation failed");
    } else {
        warn!(operation, error = %err, "directory operation failed");
    }
    err
}

fn group_matches(group_match: GroupMatch, group_dn: &str, group: &str) -> bool {
    match group_match {
        GroupMatch::Substring => group_dn.contains(group),
        GroupMatch::CommonName => match DistinguishedName::parse(group_dn) {
            Ok(dn) => dn
                .common_name()
                .is_some_and(|cn| cn.eq_ignore_ascii_case(group)),
            Err(err) => {
                warn!(group_dn, error = %err, "ignoring group with unparsable DN");
                false
            }
        },
    }
}
