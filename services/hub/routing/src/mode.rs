//! Delivery modes for commands addressed to remote nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How commands reach a remote node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Single `unicast` envelope, the firmware finds the neighbor
    #[default]
    Unicast,
    /// `multipath` envelope along the hub's shortest path
    Multipath,
    /// Like multipath, with a pause after every reply
    Polite,
    /// Connected-path circuit to the target
    Connpath,
}

impl RouteMode {
    /// Lowercase name used in config files and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Unicast => "unicast",
            RouteMode::Multipath => "multipath",
            RouteMode::Polite => "polite",
            RouteMode::Connpath => "connpath",
        }
    }

    /// Whether routed envelopes follow the hub's graph
    pub fn uses_graph(&self) -> bool {
        matches!(self, RouteMode::Multipath | RouteMode::Polite)
    }
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unicast" => Ok(RouteMode::Unicast),
            "multipath" => Ok(RouteMode::Multipath),
            "polite" => Ok(RouteMode::Polite),
            "connpath" => Ok(RouteMode::Connpath),
            other => Err(format!("unknown route mode '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for mode in [
            RouteMode::Unicast,
            RouteMode::Multipath,
            RouteMode::Polite,
            RouteMode::Connpath,
        ] {
            assert_eq!(mode.to_string().parse::<RouteMode>().unwrap(), mode);
        }
        assert_eq!("POLITE".parse::<RouteMode>().unwrap(), RouteMode::Polite);
        assert!("beacons".parse::<RouteMode>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&RouteMode::Connpath).unwrap(), "\"connpath\"");
        let mode: RouteMode = serde_json::from_str("\"multipath\"").unwrap();
        assert_eq!(mode, RouteMode::Multipath);
    }
}
