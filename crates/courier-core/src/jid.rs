//! Structural parsing, validation and canonicalization of protocol identifiers.
//!
//! An identifier has the shape `user[_agent][:device]@server`. Canonical user
//! identifiers drop the agent and device parts and live on
//! [`DEFAULT_USER_SERVER`].

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server of routable user identifiers.
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
/// Legacy user server still seen in older payloads.
pub const LEGACY_USER_SERVER: &str = "c.us";
/// Server of privacy-preserving native identifiers.
pub const LID_SERVER: &str = "lid";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const NEWSLETTER_SERVER: &str = "newsletter";

const KNOWN_SERVERS: &[&str] = &[
    DEFAULT_USER_SERVER,
    LEGACY_USER_SERVER,
    LID_SERVER,
    GROUP_SERVER,
    BROADCAST_SERVER,
    NEWSLETTER_SERVER,
    "call",
    "hosted",
    "hosted.lid",
];

/// Reasons an identifier is not well formed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier '{0}' has no server part")]
    MissingServer(String),
    #[error("identifier '{0}' has an empty user part")]
    EmptyUser(String),
    #[error("identifier '{input}' contains illegal character {ch:?}")]
    IllegalCharacter { input: String, ch: char },
    #[error("identifier '{input}' has unknown server '{server}'")]
    UnknownServer { input: String, server: String },
    #[error("identifier '{0}' has a malformed device or agent suffix")]
    InvalidSuffix(String),
    #[error("identifier '{input}' is not on the '{expected}' server")]
    UnexpectedServer {
        input: String,
        expected: &'static str,
    },
}

/// Decoded identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub agent: Option<u8>,
    pub device: Option<u16>,
    pub server: String,
}

impl Jid {
    /// Decode `raw`, rejecting empty segments, illegal characters and
    /// servers outside the protocol's set.
    pub fn parse(raw: &str) -> Result<Self, JidError> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(JidError::Empty);
        }
        let Some((combined, server)) = input.split_once('@') else {
            return Err(JidError::MissingServer(input.to_owned()));
        };
        if server.is_empty() {
            return Err(JidError::MissingServer(input.to_owned()));
        }
        if !KNOWN_SERVERS.contains(&server) {
            return Err(JidError::UnknownServer {
                input: input.to_owned(),
                server: server.to_owned(),
            });
        }

        let (user_agent, device) = match combined.split_once(':') {
            Some((head, device)) => (head, Some(parse_suffix::<u16>(device, input)?)),
            None => (combined, None),
        };
        let (user, agent) = match user_agent.split_once('_') {
            Some((user, agent)) => (user, Some(parse_suffix::<u8>(agent, input)?)),
            None => (user_agent, None),
        };

        if user.is_empty() {
            return Err(JidError::EmptyUser(input.to_owned()));
        }
        if let Some(ch) = user.chars().find(|ch| !is_user_char(*ch)) {
            return Err(JidError::IllegalCharacter {
                input: input.to_owned(),
                ch,
            });
        }

        Ok(Self {
            user: user.to_owned(),
            agent,
            device,
            server: server.to_owned(),
        })
    }

    /// `user@server` without agent or device.
    pub fn user_jid(&self) -> String {
        format!("{}@{}", self.user, self.server)
    }

    pub fn is_lid(&self) -> bool {
        self.server == LID_SERVER
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user)?;
        if let Some(agent) = self.agent {
            write!(f, "_{agent}")?;
        }
        if let Some(device) = self.device {
            write!(f, ":{device}")?;
        }
        write!(f, "@{}", self.server)
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

fn parse_suffix<T: FromStr>(raw: &str, input: &str) -> Result<T, JidError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(JidError::InvalidSuffix(input.to_owned()));
    }
    raw.parse()
        .map_err(|_| JidError::InvalidSuffix(input.to_owned()))
}

fn is_user_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '-' || ch == '.'
}

/// Outcome of a structural identifier check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub error: Option<String>,
}

/// Structural well-formedness check. Pure; nothing is cached.
pub fn validate_jid(candidate: &str) -> ValidationResult {
    match Jid::parse(candidate) {
        Ok(_) => ValidationResult {
            is_valid: true,
            error: None,
        },
        Err(err) => ValidationResult {
            is_valid: false,
            error: Some(err.to_string()),
        },
    }
}

/// User component of `jid`, without agent or device.
pub fn jid_user(jid: &str) -> Option<String> {
    Jid::parse(jid).ok().map(|jid| jid.user)
}

/// Whether two identifiers name the same user, ignoring device and agent.
/// Unparseable identifiers never match.
pub fn are_jids_same_user(left: &str, right: &str) -> bool {
    match (Jid::parse(left), Jid::parse(right)) {
        (Ok(left), Ok(right)) => left.user == right.user,
        _ => false,
    }
}

/// Native-to-canonical conversion strategy.
///
/// Implementations must be idempotent: converting an already canonical
/// identifier returns it unchanged.
pub trait JidConverter: Send + Sync {
    fn to_jid(&self, native: &str) -> Result<String, JidError>;
}

/// Default conversion: strip agent and device, rewrite aliased servers to
/// their routable server, and attach bare phone numbers to the user server.
#[derive(Debug, Clone)]
pub struct StructuralJidConverter {
    user_server: String,
    aliases: BTreeMap<String, String>,
}

impl Default for StructuralJidConverter {
    fn default() -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert(LEGACY_USER_SERVER.to_owned(), DEFAULT_USER_SERVER.to_owned());
        aliases.insert(LID_SERVER.to_owned(), DEFAULT_USER_SERVER.to_owned());
        Self {
            user_server: DEFAULT_USER_SERVER.to_owned(),
            aliases,
        }
    }
}

impl StructuralJidConverter {
    /// Converter with no server aliases.
    pub fn without_aliases() -> Self {
        Self {
            aliases: BTreeMap::new(),
            ..Self::default()
        }
    }

    /// Rewrite `from` to `to` during conversion. `to` must not itself be an
    /// aliased server.
    pub fn with_alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.aliases.insert(from.into(), to.into());
        self
    }
}

impl JidConverter for StructuralJidConverter {
    fn to_jid(&self, native: &str) -> Result<String, JidError> {
        let input = native.trim();
        if input.is_empty() {
            return Err(JidError::Empty);
        }

        if !input.contains('@') {
            let digits = input.strip_prefix('+').unwrap_or(input);
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return Ok(format!("{digits}@{}", self.user_server));
            }
            return Err(JidError::MissingServer(input.to_owned()));
        }

        let mut jid = Jid::parse(input)?;
        if let Some(target) = self.aliases.get(&jid.server) {
            jid.server = target.clone();
        }
        Ok(jid.user_jid())
    }
}
