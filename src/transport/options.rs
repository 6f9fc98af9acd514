//! Static option tables.
//!
//! Session and server properties are addressed by name. Each name maps to an
//! engine option identifier plus the kind of value it takes. Lookups go
//! through a lazily built index so property access stays O(1) regardless of
//! table size.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use russh::keys::PrivateKey;

use crate::error::{Error, Result};

/// Kind of value an option accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Int,
    Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionOption {
    Host,
    Port,
    User,
    LogVerbosity,
    Timeout,
    Compression,
    KnownHosts,
    IdentityFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindOption {
    Address,
    Port,
    HostKeyPath,
    HostKey,
    LogVerbosity,
    Banner,
}

#[derive(Debug, Clone, Copy)]
pub struct OptionSpec<O: 'static> {
    pub name: &'static str,
    pub option: O,
    pub kind: ValueKind,
}

pub static SESSION_OPTIONS: &[OptionSpec<SessionOption>] = &[
    OptionSpec { name: "host", option: SessionOption::Host, kind: ValueKind::String },
    OptionSpec { name: "port", option: SessionOption::Port, kind: ValueKind::Int },
    OptionSpec { name: "user", option: SessionOption::User, kind: ValueKind::String },
    OptionSpec { name: "log_verbosity", option: SessionOption::LogVerbosity, kind: ValueKind::Int },
    OptionSpec { name: "timeout", option: SessionOption::Timeout, kind: ValueKind::Int },
    OptionSpec { name: "compression", option: SessionOption::Compression, kind: ValueKind::String },
    OptionSpec { name: "known_hosts", option: SessionOption::KnownHosts, kind: ValueKind::String },
    OptionSpec { name: "identity", option: SessionOption::IdentityFile, kind: ValueKind::String },
];

pub static BIND_OPTIONS: &[OptionSpec<BindOption>] = &[
    OptionSpec { name: "addr", option: BindOption::Address, kind: ValueKind::String },
    OptionSpec { name: "port", option: BindOption::Port, kind: ValueKind::Int },
    OptionSpec { name: "host_key_path", option: BindOption::HostKeyPath, kind: ValueKind::String },
    OptionSpec { name: "host_key", option: BindOption::HostKey, kind: ValueKind::Key },
    OptionSpec { name: "log_verbosity", option: BindOption::LogVerbosity, kind: ValueKind::Int },
    OptionSpec { name: "banner", option: BindOption::Banner, kind: ValueKind::String },
];

static SESSION_INDEX: Lazy<HashMap<&'static str, &'static OptionSpec<SessionOption>>> =
    Lazy::new(|| SESSION_OPTIONS.iter().map(|spec| (spec.name, spec)).collect());

static BIND_INDEX: Lazy<HashMap<&'static str, &'static OptionSpec<BindOption>>> =
    Lazy::new(|| BIND_OPTIONS.iter().map(|spec| (spec.name, spec)).collect());

pub fn session_option(name: &str) -> Result<&'static OptionSpec<SessionOption>> {
    SESSION_INDEX
        .get(name)
        .copied()
        .ok_or_else(|| Error::InvalidArgument(format!("unsupported session option `{name}`")))
}

pub fn bind_option(name: &str) -> Result<&'static OptionSpec<BindOption>> {
    BIND_INDEX
        .get(name)
        .copied()
        .ok_or_else(|| Error::InvalidArgument(format!("unsupported server option `{name}`")))
}

/// A property value.
///
/// There is no "unset" value: options can be replaced, never cleared.
#[derive(Clone)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Key(Arc<PrivateKey>),
}

impl OptionValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            OptionValue::Str(_) => ValueKind::String,
            OptionValue::Int(_) => ValueKind::Int,
            OptionValue::Key(_) => ValueKind::Key,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_key(&self) -> Option<&Arc<PrivateKey>> {
        match self {
            OptionValue::Key(key) => Some(key),
            _ => None,
        }
    }

    /// String form for mirroring; keys are never rendered.
    pub fn display_value(&self) -> Option<String> {
        match self {
            OptionValue::Str(value) => Some(value.clone()),
            OptionValue::Int(value) => Some(value.to_string()),
            OptionValue::Key(_) => None,
        }
    }
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Str(value) => f.debug_tuple("Str").field(value).finish(),
            OptionValue::Int(value) => f.debug_tuple("Int").field(value).finish(),
            OptionValue::Key(_) => f.write_str("Key(..)"),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<u16> for OptionValue {
    fn from(value: u16) -> Self {
        OptionValue::Int(i64::from(value))
    }
}

impl From<Arc<PrivateKey>> for OptionValue {
    fn from(value: Arc<PrivateKey>) -> Self {
        OptionValue::Key(value)
    }
}

/// Reject a value whose kind does not match the option's declared kind.
pub fn check_kind<O>(spec: &OptionSpec<O>, value: &OptionValue) -> Result<()> {
    if spec.kind == value.kind() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "option `{}` expects a {:?} value, got {:?}",
            spec.name,
            spec.kind,
            value.kind()
        )))
    }
}

/// Validate an integer port value.
pub(crate) fn port_from(value: &OptionValue) -> Option<u16> {
    value.as_int().and_then(|port| u16::try_from(port).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lookup() {
        let spec = session_option("user").unwrap();
        assert_eq!(spec.option, SessionOption::User);
        assert_eq!(spec.kind, ValueKind::String);

        let spec = session_option("port").unwrap();
        assert_eq!(spec.kind, ValueKind::Int);
    }

    #[test]
    fn test_bind_lookup() {
        assert_eq!(bind_option("host_key").unwrap().kind, ValueKind::Key);
        assert_eq!(bind_option("addr").unwrap().option, BindOption::Address);
    }

    #[test]
    fn test_unknown_names_rejected() {
        assert!(session_option("ciphers").unwrap_err().is_usage());
        assert!(bind_option("host").unwrap_err().is_usage());
    }

    #[test]
    fn test_every_entry_is_indexed() {
        for spec in SESSION_OPTIONS {
            assert_eq!(session_option(spec.name).unwrap().option, spec.option);
        }
        for spec in BIND_OPTIONS {
            assert_eq!(bind_option(spec.name).unwrap().option, spec.option);
        }
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let spec = session_option("port").unwrap();
        assert!(check_kind(spec, &OptionValue::from(2222u16)).is_ok());
        assert!(check_kind(spec, &OptionValue::from("2222")).unwrap_err().is_usage());
    }

    #[test]
    fn test_port_range() {
        assert_eq!(port_from(&OptionValue::Int(22)), Some(22));
        assert_eq!(port_from(&OptionValue::Int(70000)), None);
        assert_eq!(port_from(&OptionValue::Int(-1)), None);
        assert_eq!(port_from(&OptionValue::from("22")), None);
    }
}
