//! Connection URL parsing.
//!
//! `scheme://host[:port][,host2[:port2]...]/database?key=value&...`
//!
//! Host entries come in three shapes: plain `host[:port]`, bracketed IPv6
//! literals `[::1]:3306`, and the verbose
//! `address=(host=..)(port=..)(type=..)` group form. Malformed input is an
//! argument error here, never a connect-time error.

use std::fmt;

use thiserror::Error;

use crate::config::{ConfigError, ConnectionOptions};

pub const DEFAULT_PORT: u16 = 3306;

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Missing scheme separator '://'")]
    MissingScheme,
    #[error("Unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("Empty host list")]
    EmptyHostList,
    #[error("Invalid host entry '{0}'")]
    InvalidHost(String),
    #[error("Invalid port in '{0}'")]
    InvalidPort(String),
    #[error("Malformed address group '{0}'")]
    MalformedAddressGroup(String),
    #[error("Invalid query pair '{0}': missing '='")]
    MissingEquals(String),
    #[error(transparent)]
    Option(#[from] ConfigError),
}

/// Role of a host in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    Primary,
    Replica,
}

impl HostRole {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "master" | "primary" => Some(HostRole::Primary),
            "slave" | "replica" => Some(HostRole::Replica),
            _ => None,
        }
    }
}

/// One parsed host. Immutable once parsed; owned by the failover
/// coordinator's address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
    pub role: HostRole,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16, role: HostRole) -> Self {
        Self {
            host: host.into(),
            port,
            role,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Fully parsed connection URL
#[derive(Debug, Clone)]
pub struct ConnectionUrl {
    pub hosts: Vec<HostAddress>,
    pub database: Option<String>,
    pub options: ConnectionOptions,
}

impl ConnectionUrl {
    pub fn parse(url: &str) -> Result<Self, UrlError> {
        let rest = match url.split_once("://") {
            Some((scheme, rest)) => {
                match scheme {
                    "mysql" | "mariadb" | "jdbc:mysql" | "jdbc:mariadb" => {}
                    other => return Err(UrlError::UnsupportedScheme(other.to_string())),
                }
                rest
            }
            None => return Err(UrlError::MissingScheme),
        };

        // Query string first, it may contain '/' in values
        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };

        // Split host list from the database path. A '/' inside brackets
        // cannot occur, so the first one after the host list terminates it.
        let (host_part, database) = match rest.split_once('/') {
            Some((hosts, db)) if !db.is_empty() => (hosts, Some(db.to_string())),
            Some((hosts, _)) => (hosts, None),
            None => (rest, None),
        };

        let hosts = parse_host_list(host_part)?;

        let mut options = ConnectionOptions::default();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| UrlError::MissingEquals(pair.to_string()))?;
                options.apply_url_option(key, value)?;
            }
        }

        Ok(Self {
            hosts,
            database,
            options,
        })
    }

    pub fn primary_hosts(&self) -> impl Iterator<Item = &HostAddress> {
        self.hosts.iter().filter(|h| h.role == HostRole::Primary)
    }

    pub fn replica_hosts(&self) -> impl Iterator<Item = &HostAddress> {
        self.hosts.iter().filter(|h| h.role == HostRole::Replica)
    }
}

fn parse_host_list(input: &str) -> Result<Vec<HostAddress>, UrlError> {
    if input.is_empty() {
        return Err(UrlError::EmptyHostList);
    }

    let mut hosts = Vec::new();
    for (idx, entry) in split_host_entries(input).into_iter().enumerate() {
        // Plain entries default to primary-first, replicas after
        let default_role = if idx == 0 {
            HostRole::Primary
        } else {
            HostRole::Replica
        };
        hosts.push(parse_host_entry(&entry, default_role)?);
    }
    Ok(hosts)
}

/// Split on commas that are not inside an `address=(...)` group or brackets
fn split_host_entries(input: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in input.chars() {
        match ch {
            '(' | '[' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                entries.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    entries.push(current);
    entries
}

fn parse_host_entry(entry: &str, default_role: HostRole) -> Result<HostAddress, UrlError> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Err(UrlError::InvalidHost(entry.to_string()));
    }

    if entry.starts_with("address=") {
        return parse_address_group(entry);
    }

    // Bracketed IPv6 literal
    if let Some(rest) = entry.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(UrlError::InvalidHost(entry.to_string()));
        };
        let port = match tail.strip_prefix(':') {
            Some(port_str) => port_str
                .parse()
                .map_err(|_| UrlError::InvalidPort(entry.to_string()))?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(UrlError::InvalidHost(entry.to_string())),
        };
        return Ok(HostAddress::new(host, port, default_role));
    }

    match entry.rsplit_once(':') {
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(UrlError::InvalidHost(entry.to_string()));
            }
            let port = port_str
                .parse()
                .map_err(|_| UrlError::InvalidPort(entry.to_string()))?;
            Ok(HostAddress::new(host, port, default_role))
        }
        None => Ok(HostAddress::new(entry, DEFAULT_PORT, default_role)),
    }
}

/// Verbose form: `address=(host=db1)(port=3307)(type=master)`
fn parse_address_group(entry: &str) -> Result<HostAddress, UrlError> {
    let malformed = || UrlError::MalformedAddressGroup(entry.to_string());
    let body = entry.strip_prefix("address=").ok_or_else(malformed)?;

    let mut host: Option<String> = None;
    let mut port = DEFAULT_PORT;
    let mut role: Option<HostRole> = None;

    let mut rest = body;
    while !rest.is_empty() {
        let inner = rest.strip_prefix('(').ok_or_else(malformed)?;
        let (pair, tail) = inner.split_once(')').ok_or_else(malformed)?;
        rest = tail;

        let (key, value) = pair.split_once('=').ok_or_else(malformed)?;
        match key.trim().to_ascii_lowercase().as_str() {
            "host" => host = Some(value.trim().to_string()),
            "port" => {
                port = value
                    .trim()
                    .parse()
                    .map_err(|_| UrlError::InvalidPort(entry.to_string()))?
            }
            "type" => {
                role = Some(HostRole::from_tag(value.trim()).ok_or_else(malformed)?);
            }
            _ => return Err(malformed()),
        }
    }

    let host = host.ok_or_else(malformed)?;
    Ok(HostAddress::new(
        host,
        port,
        role.unwrap_or(HostRole::Primary),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_host_defaults() {
        let url = ConnectionUrl::parse("mysql://db.example.com/orders").unwrap();
        assert_eq!(url.hosts.len(), 1);
        assert_eq!(url.hosts[0].host, "db.example.com");
        assert_eq!(url.hosts[0].port, DEFAULT_PORT);
        assert_eq!(url.hosts[0].role, HostRole::Primary);
        assert_eq!(url.database.as_deref(), Some("orders"));
    }

    #[test]
    fn multi_host_order_and_roles_preserved() {
        let url =
            ConnectionUrl::parse("mariadb://db1:3307,db2:3308,db3/test").unwrap();
        let hosts: Vec<_> = url
            .hosts
            .iter()
            .map(|h| (h.host.as_str(), h.port, h.role))
            .collect();
        assert_eq!(
            hosts,
            vec![
                ("db1", 3307, HostRole::Primary),
                ("db2", 3308, HostRole::Replica),
                ("db3", DEFAULT_PORT, HostRole::Replica),
            ]
        );
    }

    #[test]
    fn verbose_address_groups() {
        let url = ConnectionUrl::parse(
            "mysql://address=(host=master1)(port=3307)(type=master),address=(host=replica1)(type=slave)/db",
        )
        .unwrap();
        assert_eq!(url.hosts[0].host, "master1");
        assert_eq!(url.hosts[0].port, 3307);
        assert_eq!(url.hosts[0].role, HostRole::Primary);
        assert_eq!(url.hosts[1].host, "replica1");
        assert_eq!(url.hosts[1].port, DEFAULT_PORT);
        assert_eq!(url.hosts[1].role, HostRole::Replica);
    }

    #[test]
    fn ipv6_literal_host() {
        let url = ConnectionUrl::parse("mysql://[2001:db8::1]:3307/db").unwrap();
        assert_eq!(url.hosts[0].host, "2001:db8::1");
        assert_eq!(url.hosts[0].port, 3307);

        let url = ConnectionUrl::parse("mysql://[::1]/db").unwrap();
        assert_eq!(url.hosts[0].host, "::1");
        assert_eq!(url.hosts[0].port, DEFAULT_PORT);
    }

    #[test]
    fn options_from_query() {
        let url = ConnectionUrl::parse(
            "mysql://db/test?user=app&password=pw&allowMultiQueries=true&useCursorFetch=true",
        )
        .unwrap();
        assert_eq!(url.options.user, "app");
        assert_eq!(url.options.password.as_deref(), Some("pw"));
        assert!(url.options.allow_multi_queries);
        assert!(url.options.use_cursor_fetch);
    }

    #[test]
    fn parse_errors_are_immediate() {
        assert!(matches!(
            ConnectionUrl::parse("db.example.com/test"),
            Err(UrlError::MissingScheme)
        ));
        assert!(matches!(
            ConnectionUrl::parse("postgres://db/test"),
            Err(UrlError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ConnectionUrl::parse("mysql://db/test?badpair"),
            Err(UrlError::MissingEquals(_))
        ));
        assert!(matches!(
            ConnectionUrl::parse("mysql://address=(host=a)(bogus)/db"),
            Err(UrlError::MalformedAddressGroup(_))
        ));
        assert!(matches!(
            ConnectionUrl::parse("mysql://db:notaport/test"),
            Err(UrlError::InvalidPort(_))
        ));
        assert!(matches!(
            ConnectionUrl::parse("mysql://db/test?noSuchOption=1"),
            Err(UrlError::Option(_))
        ));
    }

    #[test]
    fn no_database_is_allowed() {
        let url = ConnectionUrl::parse("mysql://db1").unwrap();
        assert!(url.database.is_none());
        let url = ConnectionUrl::parse("mysql://db1/").unwrap();
        assert!(url.database.is_none());
    }
}
