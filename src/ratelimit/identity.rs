//! Client identities and the namespaces they are tracked in.

use serde::{Deserialize, Serialize};

/// Namespace an identity key belongs to.
///
/// IP addresses and usernames are tracked independently, so the same
/// string under two kinds never refers to the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Ip,
    User,
}

impl KeyKind {
    /// Both namespaces, in the order they are evaluated.
    pub const ALL: [KeyKind; 2] = [KeyKind::Ip, KeyKind::User];

    /// Short name used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Ip => "ip",
            KeyKind::User => "user",
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The client identity attached to one authentication attempt.
///
/// Empty strings are normalized away, so an empty IP or username simply
/// skips that namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity<'a> {
    ip: Option<&'a str>,
    username: Option<&'a str>,
}

impl<'a> Identity<'a> {
    /// Create a new identity from a client IP and an optional username.
    pub fn new(ip: &'a str, username: Option<&'a str>) -> Self {
        Self {
            ip: Some(ip).filter(|s| !s.is_empty()),
            username: username.filter(|s| !s.is_empty()),
        }
    }

    /// The client IP, if present.
    pub fn ip(&self) -> Option<&'a str> {
        self.ip
    }

    /// The username, if present.
    pub fn username(&self) -> Option<&'a str> {
        self.username
    }

    /// Key for the given namespace, if this identity has one.
    pub fn key(&self, kind: KeyKind) -> Option<&'a str> {
        match kind {
            KeyKind::Ip => self.ip,
            KeyKind::User => self.username,
        }
    }

    /// Iterate over the namespaces this identity populates.
    pub fn keys(&self) -> impl Iterator<Item = (KeyKind, &'a str)> + '_ {
        KeyKind::ALL
            .into_iter()
            .filter_map(move |kind| self.key(kind).map(|key| (kind, key)))
    }
}

impl std::fmt::Display for Identity<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ip={},user={}",
            self.ip.unwrap_or("-"),
            self.username.unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_with_username() {
        let identity = Identity::new("10.0.0.1", Some("alice"));

        let keys: Vec<_> = identity.keys().collect();
        assert_eq!(keys, vec![(KeyKind::Ip, "10.0.0.1"), (KeyKind::User, "alice")]);
    }

    #[test]
    fn test_identity_without_username() {
        let identity = Identity::new("10.0.0.1", None);

        assert_eq!(identity.username(), None);
        assert_eq!(identity.keys().count(), 1);
    }

    #[test]
    fn test_empty_strings_are_skipped() {
        let identity = Identity::new("", Some(""));

        assert_eq!(identity.ip(), None);
        assert_eq!(identity.username(), None);
        assert_eq!(identity.keys().count(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Identity::new("1.2.3.4", Some("bob")).to_string(), "ip=1.2.3.4,user=bob");
        assert_eq!(Identity::new("1.2.3.4", None).to_string(), "ip=1.2.3.4,user=-");
        assert_eq!(KeyKind::User.to_string(), "user");
    }
}
