//! Thin newtypes over `String` for the identifiers that flow across every
//! layer of the control plane. Kept distinct so a `SandboxId` can never be
//! passed where a `HostId` is expected, the way `peinit` favors a named
//! `Config` type over a bag of loose strings.

use std::fmt;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(HostId);
string_id!(OrgId);
string_id!(SandboxId);
string_id!(RequestId);

impl RequestId {
    /// Generates a fresh UUIDv4 request id, as required for every
    /// `ControlMessage` the server issues.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Generates a server-assigned sandbox id, prefixed per the data model
/// (`SBX-<uuid>`).
pub fn generate_sandbox_id() -> SandboxId {
    SandboxId(format!("SBX-{}", uuid::Uuid::new_v4()))
}
