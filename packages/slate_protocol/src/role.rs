//! Channel roles resolved by the external authorization collaborator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role of a principal within one channel. Ordered: Viewer < Editor < Owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl Role {
    /// Whether this role may publish envelopes into the channel.
    /// Viewers connect and receive broadcasts but all inbound messages
    /// from them are rejected.
    pub fn can_publish(&self) -> bool {
        *self >= Role::Editor
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Viewer => write!(f, "viewer"),
            Self::Editor => write!(f, "editor"),
            Self::Owner => write!(f, "owner"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "editor" => Ok(Self::Editor),
            "owner" => Ok(Self::Owner),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(Role::Viewer < Role::Editor);
        assert!(Role::Editor < Role::Owner);
    }

    #[test]
    fn publish_rights() {
        assert!(!Role::Viewer.can_publish());
        assert!(Role::Editor.can_publish());
        assert!(Role::Owner.can_publish());
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Editor).unwrap(), r#""editor""#);
        let back: Role = serde_json::from_str(r#""owner""#).unwrap();
        assert_eq!(back, Role::Owner);
    }

    #[test]
    fn from_str_round_trip() {
        for role in [Role::Viewer, Role::Editor, Role::Owner] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("admin".parse::<Role>().is_err());
    }
}
