//! Configuration for the directory authenticator.

use crate::dn::DistinguishedName;
use dirauth_core::{Error, Result};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use validator::Validate;

/// Default connection timeout (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default operation time limit (seconds).
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 10;
/// Only LDAPv3 is supported.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 3;

const SUPPORTED_SCHEMES: &[&str] = &["ldap", "ldaps", "ldapi"];

/// How `authenticate` verifies the end user's credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserBindMode {
    /// Bind on a separate, short-lived connection; the lookup connection keeps the search
    /// user's identity.
    #[default]
    Dedicated,
    /// Rebind the lookup connection itself as the end user. The search user is bound again
    /// before the next lookup.
    Shared,
}

/// How a group entry's DN is compared with the requested group name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMatch {
    /// The group name occurs anywhere in the group entry's DN.
    #[default]
    Substring,
    /// The group entry's `cn` equals the group name (ASCII case-insensitive).
    CommonName,
}

/// Configuration for connecting to and searching the directory.
///
/// Immutable once built; the authenticator shares it behind an `Arc`.
#[derive(Debug, Deserialize, Validate)]
pub struct DirectoryConfig {
    #[validate(url)]
    uri: String,
    base_dn: DistinguishedName,
    #[validate(length(min = 1))]
    search_user_name: String,
    #[serde(deserialize_with = "deserialize_secret")]
    search_user_password: SecretString,
    #[serde(default)]
    follow_referrals: bool,
    #[serde(default)]
    referral_bind_hosts: Vec<String>,
    #[validate(length(min = 1))]
    #[serde(default = "default_object_class")]
    object_class: String,
    #[validate(length(min = 1))]
    #[serde(default = "default_login_attribute")]
    login_attribute: String,
    #[validate(range(min = 3, max = 3))]
    #[serde(default = "default_protocol_version")]
    protocol_version: u32,
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_operation_timeout_secs")]
    operation_timeout_secs: u64,
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_connect_timeout_secs")]
    connect_timeout_secs: u64,
    #[serde(default)]
    starttls: bool,
    #[serde(default = "default_tls_verify")]
    tls_verify: bool,
    #[serde(default)]
    tls_ca_cert: Option<PathBuf>,
    #[serde(default = "default_escape_filter_values")]
    escape_filter_values: bool,
    #[serde(default)]
    user_bind_mode: UserBindMode,
    #[serde(default)]
    group_match: GroupMatch,
}

fn default_object_class() -> String {
    "person".to_string()
}

fn default_login_attribute() -> String {
    "uid".to_string()
}

const fn default_protocol_version() -> u32 {
    DEFAULT_PROTOCOL_VERSION
}

const fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_SECS
}

const fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

const fn default_tls_verify() -> bool {
    true
}

const fn default_escape_filter_values() -> bool {
    true
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

impl DirectoryConfig {
    /// Creates a configuration with the required settings and defaults for everything else.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URI is not an `ldap`, `ldaps` or `ldapi` URL or the
    /// search user name is empty, and [`Error::InvalidDn`] if `base_dn` does not parse.
    pub fn new(
        uri: impl Into<String>,
        base_dn: impl AsRef<str>,
        search_user_name: impl Into<String>,
        search_user_password: impl Into<String>,
    ) -> Result<Self> {
        let config = Self {
            uri: uri.into(),
            base_dn: DistinguishedName::parse(base_dn)?,
            search_user_name: search_user_name.into(),
            search_user_password: SecretString::from(search_user_password.into()),
            follow_referrals: false,
            referral_bind_hosts: Vec::new(),
            object_class: default_object_class(),
            login_attribute: default_login_attribute(),
            protocol_version: default_protocol_version(),
            operation_timeout_secs: default_operation_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            starttls: false,
            tls_verify: default_tls_verify(),
            tls_ca_cert: None,
            escape_filter_values: default_escape_filter_values(),
            user_bind_mode: UserBindMode::default(),
            group_match: GroupMatch::default(),
        };
        config.check()?;
        Ok(config)
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is malformed or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    /// Re-runs validation. The authenticator constructors call this, so builder overrides are
    /// checked before anything reaches the directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first failing setting group.
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        let scheme = Url::parse(&self.uri)?.scheme().to_ascii_lowercase();
        if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
            return Err(Error::Config(format!(
                "unsupported directory URI scheme `{scheme}`"
            )));
        }
        if self.starttls && scheme != "ldap" {
            return Err(Error::Config(
                "StartTLS requires an ldap:// URI".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory server address, including scheme and port.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Root of every search.
    #[must_use]
    pub const fn base_dn(&self) -> &DistinguishedName {
        &self.base_dn
    }

    /// DN of the privileged lookup account.
    #[must_use]
    pub fn search_user_name(&self) -> &str {
        &self.search_user_name
    }

    /// Password of the privileged lookup account.
    #[must_use]
    pub const fn search_user_password(&self) -> &SecretString {
        &self.search_user_password
    }

    /// Whether search references are chased.
    #[must_use]
    pub const fn follow_referrals(&self) -> bool {
        self.follow_referrals
    }

    /// Referral hosts that receive the search user's credentials. Other referrals are
    /// followed anonymously.
    #[must_use]
    pub fn referral_bind_hosts(&self) -> &[String] {
        &self.referral_bind_hosts
    }

    /// Object class of user entries.
    #[must_use]
    pub fn object_class(&self) -> &str {
        &self.object_class
    }

    /// Attribute holding the login name.
    #[must_use]
    pub fn login_attribute(&self) -> &str {
        &self.login_attribute
    }

    /// Protocol version requested on the connection.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Time limit applied to every directory operation.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Time limit for establishing the connection.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Whether an `ldap://` connection is upgraded with StartTLS.
    #[must_use]
    pub const fn starttls(&self) -> bool {
        self.starttls
    }

    /// Whether TLS certificates are verified.
    #[must_use]
    pub const fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    /// Optional PEM bundle trusted in addition to the system roots.
    #[must_use]
    pub fn tls_ca_cert(&self) -> Option<&PathBuf> {
        self.tls_ca_cert.as_ref()
    }

    /// Whether caller-supplied values are escaped before entering a filter.
    #[must_use]
    pub const fn escape_filter_values(&self) -> bool {
        self.escape_filter_values
    }

    /// How end-user credentials are verified.
    #[must_use]
    pub const fn user_bind_mode(&self) -> UserBindMode {
        self.user_bind_mode
    }

    /// How group entries are matched against a requested group.
    #[must_use]
    pub const fn group_match(&self) -> GroupMatch {
        self.group_match
    }

    /// Enables or disables referral chasing.
    #[must_use]
    pub const fn with_follow_referrals(mut self, follow: bool) -> Self {
        self.follow_referrals = follow;
        self
    }

    /// Allows binding as the search user on referrals to these hosts.
    #[must_use]
    pub fn with_referral_bind_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.referral_bind_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the user object class.
    #[must_use]
    pub fn with_object_class(mut self, object_class: impl Into<String>) -> Self {
        self.object_class = object_class.into();
        self
    }

    /// Overrides the login attribute.
    #[must_use]
    pub fn with_login_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.login_attribute = attribute.into();
        self
    }

    /// Overrides the protocol version. Anything but 3 fails [`DirectoryConfig::check`].
    #[must_use]
    pub const fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Overrides the operation time limit in seconds.
    #[must_use]
    pub const fn with_operation_timeout_secs(mut self, seconds: u64) -> Self {
        self.operation_timeout_secs = seconds;
        self
    }

    /// Overrides the connection timeout in seconds.
    #[must_use]
    pub const fn with_connect_timeout_secs(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Enables StartTLS on `ldap://` connections.
    #[must_use]
    pub const fn with_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub const fn with_tls_verification(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Sets a custom CA certificate path for TLS verification.
    #[must_use]
    pub fn with_tls_ca_cert(mut self, path: PathBuf) -> Self {
        self.tls_ca_cert = Some(path);
        self
    }

    /// Enables or disables filter value escaping.
    #[must_use]
    pub const fn with_filter_escaping(mut self, escape: bool) -> Self {
        self.escape_filter_values = escape;
        self
    }

    /// Selects how end-user credentials are verified.
    #[must_use]
    pub const fn with_user_bind_mode(mut self, mode: UserBindMode) -> Self {
        self.user_bind_mode = mode;
        self
    }

    /// Selects how group entries are matched.
    #[must_use]
    pub const fn with_group_match(mut self, group_match: GroupMatch) -> Self {
        self.group_match = group_match;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn sample() -> DirectoryConfig {
        DirectoryConfig::new(
            "ldap://ldap.example.com:389",
            "dc=example,dc=com",
            "cn=search,dc=example,dc=com",
            "secret",
        )
        .unwrap()
    }

    #[test]
    fn defaults() {
        let config = sample();
        assert_eq!(config.object_class(), "person");
        assert_eq!(config.login_attribute(), "uid");
        assert_eq!(config.protocol_version(), 3);
        assert!(!config.follow_referrals());
        assert!(config.referral_bind_hosts().is_empty());
        assert_eq!(config.operation_timeout(), Duration::from_secs(10));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.escape_filter_values());
        assert_eq!(config.user_bind_mode(), UserBindMode::Dedicated);
        assert_eq!(config.group_match(), GroupMatch::Substring);
        assert_eq!(config.search_user_password().expose_secret(), "secret");
    }

    #[test]
    fn builder_overrides() {
        let config = sample()
            .with_object_class("inetOrgPerson")
            .with_login_attribute("mail")
            .with_follow_referrals(true)
            .with_operation_timeout_secs(30)
            .with_connect_timeout_secs(5)
            .with_starttls(true)
            .with_tls_verification(false)
            .with_filter_escaping(false)
            .with_user_bind_mode(UserBindMode::Shared)
            .with_group_match(GroupMatch::CommonName);

        assert!(config.check().is_ok());
        assert_eq!(config.object_class(), "inetOrgPerson");
        assert_eq!(config.login_attribute(), "mail");
        assert!(config.follow_referrals());
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.starttls());
        assert!(!config.tls_verify());
        assert!(!config.escape_filter_values());
        assert_eq!(config.user_bind_mode(), UserBindMode::Shared);
        assert_eq!(config.group_match(), GroupMatch::CommonName);
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(matches!(
            DirectoryConfig::new("http://ldap.example.com", "dc=example", "cn=s", "pw"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DirectoryConfig::new("ldap://ldap.example.com", "dc=", "cn=s", "pw"),
            Err(Error::InvalidDn(_))
        ));
        assert!(matches!(
            DirectoryConfig::new("ldap://ldap.example.com", "dc=example", "", "pw"),
            Err(Error::Config(_))
        ));
        assert!(sample().with_protocol_version(2).check().is_err());
        assert!(sample().with_operation_timeout_secs(0).check().is_err());

        let ldaps = DirectoryConfig::new("ldaps://ldap.example.com:636", "dc=example", "cn=s", "pw")
            .unwrap()
            .with_starttls(true);
        assert!(matches!(ldaps.check(), Err(Error::Config(_))));
    }

    #[test]
    fn from_json_applies_defaults() {
        let config = DirectoryConfig::from_json_str(
            r#"{
                "uri": "ldaps://ldap.example.com:636",
                "base_dn": "dc=example,dc=com",
                "search_user_name": "cn=search,dc=example,dc=com",
                "search_user_password": "secret",
                "login_attribute": "sAMAccountName",
                "user_bind_mode": "shared",
                "group_match": "common_name",
                "referral_bind_hosts": ["east.example.com"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.base_dn().as_str(), "dc=example,dc=com");
        assert_eq!(config.login_attribute(), "sAMAccountName");
        assert_eq!(config.object_class(), "person");
        assert_eq!(config.user_bind_mode(), UserBindMode::Shared);
        assert_eq!(config.group_match(), GroupMatch::CommonName);
        assert_eq!(config.referral_bind_hosts(), ["east.example.com".to_string()]);
        assert!(!format!("{config:?}").contains("secret\""));
    }

    #[test]
    fn from_json_rejects_invalid_documents() {
        assert!(matches!(
            DirectoryConfig::from_json_str("{}"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DirectoryConfig::from_json_str(
                r#"{"uri": "ldap://h", "base_dn": "dc=x", "search_user_name": "cn=s",
                    "search_user_password": "p", "protocol_version": 2}"#
            ),
            Err(Error::Config(_))
        ));
    }
}
