//! Protocol version negotiation sets.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Current protocol; advertises `["1", "pre2"]`.
    #[default]
    #[serde(rename = "1")]
    V1,
    /// Legacy preference; advertises `["pre2", "pre1"]`.
    #[serde(rename = "pre2")]
    Pre2,
}

impl ProtocolVersion {
    pub fn wire_name(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1",
            ProtocolVersion::Pre2 => "pre2",
        }
    }

    /// Versions offered in the `connect` frame's `support` list, preferred
    /// first.
    pub fn support(self) -> Vec<String> {
        let names: &[&str] = match self {
            ProtocolVersion::V1 => &["1", "pre2"],
            ProtocolVersion::Pre2 => &["pre2", "pre1"],
        };
        names.iter().map(|name| (*name).to_string()).collect()
    }
}
