//! Static app-name to backend resolution.
//!
//! The registry is parsed once from the `APPS` setting and never mutated
//! afterwards, so it is shared between connections without locking.

use std::collections::HashMap;
use std::fmt;

use crate::error::ConfigError;

/// Host used when an entry only names a port.
pub const DEFAULT_BACKEND_HOST: &str = "localhost";

/// Network address of one backend app.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl BackendAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port`
    pub fn http_origin(&self) -> String {
        format!("http://{self}")
    }

    /// `ws://host:port/ws`
    pub fn ws_url(&self) -> String {
        format!("ws://{self}/ws")
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Maps application names to backend addresses.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: HashMap<String, BackendAddr>,
}

impl AppRegistry {
    /// Parses `name:port,name:port,...`. Entries may also spell out the host
    /// as `name:host:port`.
    ///
    /// Blank entries are skipped. Any malformed entry fails the whole parse so
    /// a bad line can never resolve to an unintended backend.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut apps = HashMap::new();

        for raw in spec.split(',') {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }

            let (name, target) = entry
                .split_once(':')
                .map(|(n, t)| (n.trim(), t.trim()))
                .filter(|(n, t)| !n.is_empty() && !t.is_empty())
                .ok_or_else(|| ConfigError::InvalidAppEntry {
                    entry: entry.to_string(),
                })?;

            let (host, port) = match target.rsplit_once(':') {
                Some((host, port)) if !host.trim().is_empty() => (host.trim(), port.trim()),
                Some(_) => {
                    return Err(ConfigError::InvalidAppEntry {
                        entry: entry.to_string(),
                    })
                }
                None => (DEFAULT_BACKEND_HOST, target),
            };

            let port = parse_port(entry, port)?;

            if apps
                .insert(name.to_string(), BackendAddr::new(host, port))
                .is_some()
            {
                return Err(ConfigError::DuplicateApp(name.to_string()));
            }
        }

        Ok(Self { apps })
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, BackendAddr)>,
        S: Into<String>,
    {
        Self {
            apps: entries.into_iter().map(|(n, a)| (n.into(), a)).collect(),
        }
    }

    /// Looks up an app by its exact, case-sensitive name.
    pub fn resolve(&self, name: &str) -> Option<&BackendAddr> {
        self.apps.get(name)
    }

    /// App names in sorted order, for display.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.apps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

fn parse_port(entry: &str, port: &str) -> Result<u16, ConfigError> {
    let port: u16 = port
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::InvalidPort {
            entry: entry.to_string(),
            reason: e.to_string(),
        })?;
    if port == 0 {
        return Err(ConfigError::InvalidPort {
            entry: entry.to_string(),
            reason: "port must be between 1 and 65535".to_string(),
        });
    }
    Ok(port)
}
