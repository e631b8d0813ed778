//! Contract tokens and the SNI classification that decides where a connection goes.
//!
//! A client addresses a contract by putting its token in the first label of the TLS server
//! name, e.g. `<token>.host.example`. Anything else, including a missing server name, is
//! addressed to the host itself.

use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{config::DEFAULT_TOKEN_PATTERN, HostError, HostResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static DEFAULT_TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(DEFAULT_TOKEN_PATTERN).expect("default token pattern is a valid regex")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An opaque identifier naming exactly one contract and its metering balance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(String);

/// Matches server name labels against the token format.
#[derive(Debug, Clone)]
pub struct TokenMatcher {
    regex: Regex,
}

/// Where a secure connection should be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The connection addresses a hosted contract.
    Contract(Token),

    /// The connection addresses the host's own control plane.
    Host,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Token {
    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creates a token without validating it against any pattern.
    pub(crate) fn new_unchecked(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenMatcher {
    /// Creates a matcher from a pattern. The pattern is anchored at both ends.
    pub fn new(pattern: &str) -> HostResult<Self> {
        let anchored = anchor(pattern);
        Ok(Self {
            regex: Regex::new(&anchored)?,
        })
    }

    /// Returns true if `candidate` has the token format.
    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    /// Validates `candidate` and wraps it as a [`Token`].
    pub fn parse(&self, candidate: &str) -> HostResult<Token> {
        if self.is_match(candidate) {
            Ok(Token(candidate.to_string()))
        } else {
            Err(HostError::InvalidToken(candidate.to_string()))
        }
    }

    /// Returns the label before the first `.` of a server name.
    pub fn candidate(server_name: &str) -> &str {
        server_name.split('.').next().unwrap_or_default()
    }

    /// Decides where a connection with the given SNI server name goes.
    ///
    /// This never fails: a missing, malformed or non-matching name routes to the host.
    pub fn classify(&self, server_name: Option<&str>) -> Destination {
        match server_name.map(Self::candidate) {
            Some(label) if self.is_match(label) => Destination::Contract(Token(label.to_string())),
            _ => Destination::Host,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn anchor(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for TokenMatcher {
    fn default() -> Self {
        Self {
            regex: DEFAULT_TOKEN_REGEX.clone(),
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Token {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TokenMatcher::default().parse(s)
    }
}

impl TryFrom<String> for Token {
    type Error = HostError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
