//! Bearer credentials per logical account.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{MirrorError, MirrorResult};

/// Which account a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Target,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Source, Role::Target];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Target => "target",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(Role::Source),
            "target" => Ok(Role::Target),
            other => Err(MirrorError::Config(format!(
                "Unknown role '{other}', expected 'source' or 'target'"
            ))),
        }
    }
}

/// Supplies a currently valid access token, refreshing as needed.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self, role: Role) -> MirrorResult<String>;
}
