//! Directory client capability and its `ldap3` implementation.

use crate::config::DirectoryConfig;
use async_trait::async_trait;
use dirauth_core::{Error, Result};
use ldap3::{LdapConnAsync, LdapConnSettings, LdapResult, ResultEntry, Scope, SearchEntry};
use native_tls::{Certificate, TlsConnector};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

/// LDAP result code for a referral response.
const RC_REFERRAL: u32 = 10;
/// LDAP result code reported when a requested feature is not supported.
const RC_PROTOCOL_ERROR: u32 = 2;

/// Directory entry returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attribute map (values keep the order sent by the server).
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// Creates an entry with no attributes.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: HashMap::new(),
        }
    }

    /// Adds values for an attribute.
    #[must_use]
    pub fn with_attribute<I, V>(mut self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attributes
            .entry(attribute.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Returns the first value of the attribute if present.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .and_then(|values| values.first().map(String::as_str))
    }

    /// Returns all values for the attribute.
    ///
    /// Attribute names are matched case-insensitively, as the directory does.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .get(attribute)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
                    .map(|(_, values)| values)
            })
            .map(Vec::as_slice)
    }
}

impl From<SearchEntry> for DirectoryEntry {
    fn from(entry: SearchEntry) -> Self {
        Self {
            dn: entry.dn,
            attributes: entry.attrs,
        }
    }
}

/// Option applied to a freshly opened connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOption {
    /// LDAP protocol version.
    ProtocolVersion(u32),
    /// Whether search references are chased.
    FollowReferrals(bool),
    /// Connect timeout for connections opened on behalf of this one (referrals).
    NetworkTimeout(Duration),
    /// Time limit for each operation.
    OperationTimeLimit(Duration),
}

/// An open connection to the directory.
///
/// Failures carry the directory's result code: a rejected bind is [`Error::Bind`], a failed
/// search is [`Error::Search`] and transport trouble is [`Error::Connection`] or
/// [`Error::Timeout`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Applies a connection option.
    fn set_option(&mut self, option: ConnectionOption) -> Result<()>;

    /// Sets the identity of the connection with a simple bind.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Searches the subtree under `base_dn`.
    async fn search(&mut self, base_dn: &str, filter: &str) -> Result<Vec<DirectoryEntry>>;

    /// Closes the connection.
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens directory connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Opens a connection to `uri`.
    async fn open(&self, uri: &str) -> Result<Box<dyn DirectoryConnection>>;
}

/// [`DirectoryClient`] backed by `ldap3`.
pub struct LdapClient {
    config: Arc<DirectoryConfig>,
}

impl LdapClient {
    /// Creates a client using the TLS and timeout settings of `config`.
    #[must_use]
    pub fn new(config: Arc<DirectoryConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DirectoryClient for LdapClient {
    async fn open(&self, uri: &str) -> Result<Box<dyn DirectoryConnection>> {
        let ldap = connect(&self.config, uri, self.config.connect_timeout()).await?;
        Ok(Box::new(LdapConnection::new(
            ldap,
            self.config.clone(),
            self.config.connect_timeout(),
            self.config.operation_timeout(),
        )))
    }
}

async fn connect(
    config: &DirectoryConfig,
    uri: &str,
    conn_timeout: Duration,
) -> Result<ldap3::Ldap> {
    let settings = build_ldap_settings(config, conn_timeout)?;
    debug!(uri, "opening directory connection");
    let (conn, ldap) = LdapConnAsync::with_settings(settings, uri)
        .await
        .map_err(map_transport_error)?;
    ldap3::drive!(conn);
    Ok(ldap)
}

struct LdapConnection {
    inner: ldap3::Ldap,
    config: Arc<DirectoryConfig>,
    follow_referrals: bool,
    connect_timeout: Duration,
    operation_timeout: Duration,
    /// Set while the connection is bound as the configured search user.
    search_user_bound: bool,
}

impl LdapConnection {
    fn new(
        inner: ldap3::Ldap,
        config: Arc<DirectoryConfig>,
        connect_timeout: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            config,
            follow_referrals: false,
            connect_timeout,
            operation_timeout,
            search_user_bound: false,
        }
    }

    async fn search_once(
        &mut self,
        base_dn: &str,
        filter: &str,
    ) -> Result<(Vec<DirectoryEntry>, Vec<String>)> {
        let result = timeout(
            self.operation_timeout,
            self.inner.search(base_dn, Scope::Subtree, filter, vec!["*"]),
        )
        .await
        .map_err(|_| Error::Timeout("directory search timed out".to_string()))?
        .map_err(map_transport_error)?;

        let ldap3::SearchResult(raw_entries, status) = result;
        let mut referrals = search_outcome(status)?;

        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            if raw.is_ref() {
                referrals.extend(referral_urls(raw));
            } else {
                entries.push(SearchEntry::construct(raw).into());
            }
        }
        Ok((entries, referrals))
    }

    /// Follows each reference one hop. Unreachable or refused references are skipped.
    async fn chase(
        &mut self,
        referrals: Vec<String>,
        base_dn: &str,
        filter: &str,
    ) -> Vec<DirectoryEntry> {
        let mut entries = Vec::new();
        for referral in referrals {
            match self.chase_one(&referral, base_dn, filter).await {
                Ok(found) => entries.extend(found),
                Err(err) => {
                    warn!(referral = %referral, error = %err, "skipping referral");
                }
            }
        }
        entries
    }

    async fn chase_one(
        &mut self,
        referral: &str,
        base_dn: &str,
        filter: &str,
    ) -> Result<Vec<DirectoryEntry>> {
        let config = self.config.clone();
        let target = plan_referral(&config, referral, base_dn)?;

        debug!(
            server = %target.server,
            base = %target.base,
            bind = target.bind,
            "chasing referral"
        );
        let ldap = connect(&config, &target.server, self.connect_timeout).await?;
        let mut referred =
            LdapConnection::new(ldap, config.clone(), self.connect_timeout, self.operation_timeout);
        if target.bind && self.search_user_bound {
            referred
                .bind(
                    config.search_user_name(),
                    config.search_user_password().expose_secret(),
                )
                .await?;
        }
        let (found, _) = referred.search_once(&target.base, filter).await?;
        if let Err(err) = referred.unbind().await {
            warn!(error = %err, "failed to unbind referral connection");
        }
        Ok(found)
    }
}

#[async_trait]
impl DirectoryConnection for LdapConnection {
    fn set_option(&mut self, option: ConnectionOption) -> Result<()> {
        match option {
            ConnectionOption::ProtocolVersion(3) => {}
            ConnectionOption::ProtocolVersion(version) => {
                return Err(Error::Connection {
                    code: RC_PROTOCOL_ERROR,
                    message: format!("protocol version {version} is not supported"),
                });
            }
            ConnectionOption::FollowReferrals(follow) => self.follow_referrals = follow,
            ConnectionOption::NetworkTimeout(limit) => self.connect_timeout = limit,
            ConnectionOption::OperationTimeLimit(limit) => self.operation_timeout = limit,
        }
        Ok(())
    }

    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        self.search_user_bound = false;
        let result = timeout(self.operation_timeout, self.inner.simple_bind(dn, password))
            .await
            .map_err(|_| Error::Timeout("directory bind timed out".to_string()))?
            .map_err(map_transport_error)?;
        if result.rc != 0 {
            return Err(Error::Bind {
                code: result.rc,
                message: result.text,
            });
        }
        self.search_user_bound = dn == self.config.search_user_name();
        Ok(())
    }

    async fn search(&mut self, base_dn: &str, filter: &str) -> Result<Vec<DirectoryEntry>> {
        let (mut entries, referrals) = self.search_once(base_dn, filter).await?;
        if referrals.is_empty() {
            return Ok(entries);
        }
        if self.follow_referrals {
            entries.extend(self.chase(referrals, base_dn, filter).await);
        } else {
            debug!(count = referrals.len(), "ignoring search references");
        }
        Ok(entries)
    }

    async fn unbind(&mut self) -> Result<()> {
        timeout(self.operation_timeout, self.inner.unbind())
            .await
            .map_err(|_| Error::Timeout("directory unbind timed out".to_string()))?
            .map_err(map_transport_error)
    }
}

fn referral_urls(entry: ResultEntry) -> Vec<String> {
    ldap3::parse_refs(entry.0)
}

/// Maps the final status of a search to the references it returned, or to a search failure.
fn search_outcome(status: LdapResult) -> Result<Vec<String>> {
    match status.rc {
        0 => Ok(Vec::new()),
        RC_REFERRAL => Ok(status.refs),
        code => Err(Error::Search {
            code,
            message: status.text,
        }),
    }
}

/// Where and how a search reference is followed.
#[derive(Debug, PartialEq, Eq)]
struct ReferralTarget {
    server: String,
    base: String,
    /// Bind as the search user before searching; otherwise the search is anonymous.
    bind: bool,
}

/// Validates a referral URL against the configuration.
///
/// A referral never lowers transport security: from an `ldaps://`, `ldapi://` or StartTLS
/// connection only `ldaps://` (or `ldap://` upgraded with StartTLS) is followed. Credentials are
/// only sent to hosts listed in `referral_bind_hosts`.
fn plan_referral(
    config: &DirectoryConfig,
    referral: &str,
    base_dn: &str,
) -> Result<ReferralTarget> {
    let url = Url::parse(referral)?;
    let scheme = url.scheme().to_ascii_lowercase();
    let origin_scheme = Url::parse(config.uri())?.scheme().to_ascii_lowercase();
    match scheme.as_str() {
        "ldaps" => {}
        "ldap" if config.starttls() || origin_scheme == "ldap" => {}
        "ldap" => {
            return Err(Error::connection(format!(
                "refusing referral `{referral}`: it would drop transport encryption"
            )));
        }
        other => {
            return Err(Error::connection(format!(
                "unsupported referral scheme `{other}`"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::connection(format!("referral `{referral}` has no host")))?;
    let server = match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    };
    let base = ldap3::get_url_params(&url)
        .ok()
        .map(|params| params.base.into_owned())
        .filter(|base| !base.is_empty())
        .unwrap_or_else(|| base_dn.to_string());
    let bind = config
        .referral_bind_hosts()
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(host));

    Ok(ReferralTarget { server, base, bind })
}

fn build_ldap_settings(
    config: &DirectoryConfig,
    conn_timeout: Duration,
) -> Result<LdapConnSettings> {
    let mut settings = LdapConnSettings::new()
        .set_conn_timeout(conn_timeout)
        .set_starttls(config.starttls());

    if !config.tls_verify() {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| Error::Config(format!("failed to construct TLS connector: {err}")))?;
        settings = settings.set_connector(connector).set_no_tls_verify(true);
    } else if let Some(cert_path) = config.tls_ca_cert() {
        let pem = fs::read(cert_path).map_err(|err| {
            Error::Config(format!(
                "failed to read directory CA certificate {}: {err}",
                cert_path.display()
            ))
        })?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|err| Error::Config(format!("invalid directory CA certificate: {err}")))?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| {
                Error::Config(format!("failed to load directory CA certificate: {err}"))
            })?;
        settings = settings.set_connector(connector);
    }

    Ok(settings)
}

fn map_transport_error(err: ldap3::LdapError) -> Error {
    match err {
        ldap3::LdapError::LdapResult { result } => Error::Connection {
            code: result.rc,
            message: result.text,
        },
        other => Error::connection(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_accessors() {
        let entry = DirectoryEntry::new("uid=alice,ou=people,dc=example,dc=com")
            .with_attribute("mail", ["alice@example.com", "a@example.com"]);

        assert_eq!(entry.first("mail"), Some("alice@example.com"));
        assert_eq!(entry.first("MAIL"), Some("alice@example.com"));
        assert_eq!(entry.values("mail").map(<[String]>::len), Some(2));
        assert_eq!(entry.first("cn"), None);
    }

    #[test]
    fn entry_from_search_entry() {
        let mut attrs = HashMap::new();
        attrs.insert("uid".to_string(), vec!["alice".to_string()]);
        let entry: DirectoryEntry = SearchEntry {
            dn: "uid=alice,dc=example,dc=com".to_string(),
            attrs,
            bin_attrs: HashMap::new(),
        }
        .into();

        assert_eq!(entry.dn, "uid=alice,dc=example,dc=com");
        assert_eq!(entry.first("uid"), Some("alice"));
    }

    #[test]
    fn settings_reject_missing_ca_bundle() {
        let config = DirectoryConfig::new(
            "ldaps://ldap.example.com",
            "dc=example,dc=com",
            "cn=search,dc=example,dc=com",
            "secret",
        )
        .unwrap()
        .with_tls_ca_cert("/nonexistent/ca.pem".into());

        let Err(err) = build_ldap_settings(&config, Duration::from_secs(1)) else {
            panic!("a missing CA bundle must be rejected");
        };
        assert!(matches!(err, Error::Config(_)));
    }

    fn status(rc: u32, text: &str, refs: Vec<String>) -> LdapResult {
        LdapResult {
            rc,
            matched: String::new(),
            text: text.to_string(),
            refs,
            ctrls: Vec::new(),
        }
    }

    #[test]
    fn search_status_maps_to_entries_referrals_or_failure() {
        assert!(search_outcome(status(0, "", Vec::new())).unwrap().is_empty());

        let refs = vec!["ldap://east.example.com/ou=east,dc=example,dc=com".to_string()];
        assert_eq!(search_outcome(status(10, "referral", refs.clone())).unwrap(), refs);

        assert_eq!(
            search_outcome(status(32, "no such object", Vec::new())).unwrap_err(),
            Error::Search {
                code: 32,
                message: "no such object".to_string()
            }
        );
    }

    fn config_for(uri: &str) -> DirectoryConfig {
        DirectoryConfig::new(uri, "dc=example,dc=com", "cn=search,dc=example,dc=com", "secret")
            .unwrap()
    }

    #[test]
    fn referrals_are_anonymous_unless_host_is_allowed() {
        let referral = "ldaps://east.example.com:636/ou=east,dc=example,dc=com";

        let target =
            plan_referral(&config_for("ldaps://ldap.example.com"), referral, "dc=example,dc=com")
                .unwrap();
        assert_eq!(
            target,
            ReferralTarget {
                server: "ldaps://east.example.com:636".to_string(),
                base: "ou=east,dc=example,dc=com".to_string(),
                bind: false,
            }
        );

        let config = config_for("ldaps://ldap.example.com")
            .with_referral_bind_hosts(["EAST.example.com"]);
        assert!(plan_referral(&config, referral, "dc=example,dc=com").unwrap().bind);
    }

    #[test]
    fn referral_without_base_keeps_search_base() {
        let target = plan_referral(
            &config_for("ldap://ldap.example.com"),
            "ldap://west.example.com",
            "dc=example,dc=com",
        )
        .unwrap();
        assert_eq!(target.server, "ldap://west.example.com");
        assert_eq!(target.base, "dc=example,dc=com");
    }

    #[test]
    fn referrals_never_drop_encryption() {
        let plain = "ldap://east.example.com:389/dc=example,dc=com";

        for uri in ["ldaps://ldap.example.com", "ldapi://%2Fvar%2Frun%2Fslapd.sock"] {
            let err = plan_referral(&config_for(uri), plain, "dc=example,dc=com").unwrap_err();
            assert!(matches!(err, Error::Connection { .. }), "{uri}");
        }

        let starttls = config_for("ldap://ldap.example.com").with_starttls(true);
        assert!(plan_referral(&starttls, plain, "dc=example,dc=com").is_ok());

        let err = plan_referral(
            &config_for("ldap://ldap.example.com"),
            "ldapi://%2Fvar%2Frun%2Fslapd.sock",
            "dc=example,dc=com",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[test]
    fn ldap_result_errors_keep_their_code() {
        let err = map_transport_error(ldap3::LdapError::LdapResult {
            result: ldap3::LdapResult {
                rc: 52,
                matched: String::new(),
                text: "unavailable".to_string(),
                refs: Vec::new(),
                ctrls: Vec::new(),
            },
        });
        assert_eq!(
            err,
            Error::Connection {
                code: 52,
                message: "unavailable".to_string()
            }
        );
    }
}
