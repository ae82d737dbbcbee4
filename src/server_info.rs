//! What a server tells the world about itself. The transport layer knows nothing about the
//!  game, so it asks the application through [ServerInfoSource] when answering server, player
//!  and rule queries.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;
#[cfg(test)] use mockall::automock;

/// One client slot of the game server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientSlot {
    pub active: bool,
    pub name: String,
    /// top / bottom color packed as `top << 4 | bottom`
    pub colors: i32,
    pub frags: i32,
    /// how long the client has been connected
    pub connected_for: Duration,
    pub address: String,
}

#[cfg_attr(test, automock)]
pub trait ServerInfoSource {
    fn server_name(&self) -> String;

    fn map_name(&self) -> String;

    /// All client slots in slot order, including inactive ones.
    fn client_slots(&self) -> Vec<ClientSlot>;

    /// The rule following `previous` in a stable order, or the first rule if `previous` is
    ///  empty. `None` marks the end of the list.
    fn next_rule(&self, previous: &str) -> Option<(String, String)>;
}

/// [ServerInfoSource] backed by plain values that the application updates as the game state
///  changes.
#[derive(Clone, Debug, Default)]
pub struct StaticServerInfo {
    pub server_name: String,
    pub map_name: String,
    pub clients: Vec<ClientSlot>,
    /// exported configuration variables, in name order
    pub rules: BTreeMap<String, String>,
}

impl StaticServerInfo {
    pub fn new(server_name: &str, map_name: &str) -> StaticServerInfo {
        StaticServerInfo {
            server_name: server_name.to_string(),
            map_name: map_name.to_string(),
            ..StaticServerInfo::default()
        }
    }

    pub fn with_rule(mut self, name: &str, value: &str) -> StaticServerInfo {
        self.rules.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_client(mut self, client: ClientSlot) -> StaticServerInfo {
        self.clients.push(client);
        self
    }
}

impl ServerInfoSource for StaticServerInfo {
    fn server_name(&self) -> String {
        self.server_name.clone()
    }

    fn map_name(&self) -> String {
        self.map_name.clone()
    }

    fn client_slots(&self) -> Vec<ClientSlot> {
        self.clients.clone()
    }

    fn next_rule(&self, previous: &str) -> Option<(String, String)> {
        let lower = if previous.is_empty() {
            Bound::Unbounded
        }
        else {
            Bound::Excluded(previous)
        };
        self.rules.range::<str, _>((lower, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

/// Finds the `n`th active client, skipping inactive slots.
pub fn nth_active_client(slots: &[ClientSlot], n: usize) -> Option<&ClientSlot> {
    slots.iter()
        .filter(|s| s.active)
        .nth(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn client(name: &str, active: bool) -> ClientSlot {
        ClientSlot {
            active,
            name: name.to_string(),
            colors: 0,
            frags: 0,
            connected_for: Duration::ZERO,
            address: String::new(),
        }
    }

    #[rstest]
    #[case::first("", Some("deathmatch"))]
    #[case::middle("deathmatch", Some("fraglimit"))]
    #[case::last("timelimit", None)]
    #[case::unknown_previous("gravity", Some("timelimit"))]
    fn test_next_rule(#[case] previous: &str, #[case] expected: Option<&str>) {
        let info = StaticServerInfo::new("arena", "e1m1")
            .with_rule("timelimit", "20")
            .with_rule("deathmatch", "1")
            .with_rule("fraglimit", "30");

        assert_eq!(info.next_rule(previous).map(|(name, _)| name), expected.map(|s| s.to_string()));
    }

    #[rstest]
    #[case(0, Some("b"))]
    #[case(1, Some("d"))]
    #[case(2, None)]
    fn test_nth_active_client(#[case] n: usize, #[case] expected: Option<&str>) {
        let slots = vec![client("a", false), client("b", true), client("c", false), client("d", true)];
        assert_eq!(nth_active_client(&slots, n).map(|c| c.name.as_str()), expected);
    }
}
