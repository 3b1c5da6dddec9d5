//! Node attributes parsed from `CLUSTER NODES` output
//!
//! Line format, as emitted by the server:
//!
//! ```text
//! <id> <host>:<port>@<bus-port>[,<hostname>[,<aux-key>=<value>...]] <flags> <master-id|-> <ping-sent> <pong-recv> <config-epoch> <link-state> [<slot> ...]
//! ```
//!
//! Parsing is pure: the same line always produces the same record, and the `Display`
//! form of a record parses back to an equal record.

use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{address::NodeAddress, error::ParseError};

pub const FLAG_MYSELF: &str = "myself";
pub const FLAG_MASTER: &str = "master";
pub const FLAG_SLAVE: &str = "slave";
pub const FLAG_FAIL: &str = "fail";
pub const FLAG_PFAIL: &str = "fail?";
pub const FLAG_HANDSHAKE: &str = "handshake";
pub const FLAG_NOADDR: &str = "noaddr";

/// Placeholder the server prints when a node carries no flags at all.
const NO_FLAGS: &str = "noflags";
const NO_MASTER: &str = "-";
const MIN_FIELDS: usize = 8;

/// Reporter's view of its cluster-bus link to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connected,
    Disconnected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
        }
    }
}

impl FromStr for LinkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(LinkState::Connected),
            "disconnected" => Ok(LinkState::Disconnected),
            other => Err(format!("unknown link state {other:?}")),
        }
    }
}

/// How a table scan treats malformed lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Abort the scan on the first malformed line.
    Strict,
    /// Log and skip malformed lines.
    #[default]
    Lenient,
}

/// One entry of a node's membership table.
///
/// Records are never mutated; every query re-parses current truth. `is_self` is
/// relative to the reporting node and is derived from the `myself` flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttributes {
    id: String,
    host: String,
    port: u16,
    bus_port: Option<u16>,
    hostname: Option<String>,
    /// `key=value` fields after the hostname, in server order.
    aux: Vec<String>,
    flags: BTreeSet<String>,
    is_self: bool,
    master_id: Option<String>,
    ping_sent: u64,
    pong_recv: u64,
    config_epoch: u64,
    link_state: LinkState,
    slots: Vec<String>,
}

impl NodeAttributes {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < MIN_FIELDS {
            return Err(ParseError::new(
                line,
                format!("expected at least {MIN_FIELDS} fields, found {}", fields.len()),
            ));
        }

        let id = fields[0].to_string();
        let Endpoint {
            host,
            port,
            bus_port,
            hostname,
            aux,
        } = parse_address(fields[1]).map_err(|reason| ParseError::new(line, reason))?;

        let flags: BTreeSet<String> = fields[2]
            .split(',')
            .filter(|flag| !flag.is_empty() && *flag != NO_FLAGS)
            .map(str::to_string)
            .collect();
        let is_self = flags.contains(FLAG_MYSELF);

        let master_id = match fields[3] {
            NO_MASTER => None,
            master => Some(master.to_string()),
        };

        let ping_sent = parse_counter(line, "ping-sent", fields[4])?;
        let pong_recv = parse_counter(line, "pong-recv", fields[5])?;
        let config_epoch = parse_counter(line, "config-epoch", fields[6])?;
        let link_state = fields[7]
            .parse::<LinkState>()
            .map_err(|reason| ParseError::new(line, reason))?;

        let slots = fields[MIN_FIELDS..].iter().map(|s| s.to_string()).collect();

        Ok(Self {
            id,
            host,
            port,
            bus_port,
            hostname,
            aux,
            flags,
            is_self,
            master_id,
            ping_sent,
            pong_recv,
            config_epoch,
            link_state,
            slots,
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host as announced by the reporter. Empty for nodes whose address is not known yet.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bus_port(&self) -> Option<u16> {
        self.bus_port
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Auxiliary `key=value` fields (`shard-id`, `tls-port`, ...) as printed.
    pub fn aux_fields(&self) -> &[String] {
        &self.aux
    }

    /// Value of the auxiliary field `key`, if present.
    pub fn aux(&self, key: &str) -> Option<&str> {
        self.aux.iter().find_map(|field| {
            field
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(self.host.clone(), self.port)
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }

    /// Exact flag-set membership.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// True for the entry describing the reporting node itself.
    #[inline]
    pub fn is_self(&self) -> bool {
        self.is_self
    }

    pub fn is_master(&self) -> bool {
        self.has_flag(FLAG_MASTER)
    }

    pub fn is_failing(&self) -> bool {
        self.has_flag(FLAG_FAIL) || self.has_flag(FLAG_PFAIL)
    }

    pub fn in_handshake(&self) -> bool {
        self.has_flag(FLAG_HANDSHAKE)
    }

    pub fn master_id(&self) -> Option<&str> {
        self.master_id.as_deref()
    }

    pub fn ping_sent(&self) -> u64 {
        self.ping_sent
    }

    pub fn pong_recv(&self) -> u64 {
        self.pong_recv
    }

    pub fn config_epoch(&self) -> u64 {
        self.config_epoch
    }

    #[inline]
    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.link_state == LinkState::Connected
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }
}

impl FromStr for NodeAttributes {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NodeAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.id, self.host, self.port)?;
        if let Some(bus_port) = self.bus_port {
            write!(f, "@{bus_port}")?;
            if self.hostname.is_some() || !self.aux.is_empty() {
                write!(f, ",{}", self.hostname.as_deref().unwrap_or_default())?;
            }
            for field in &self.aux {
                write!(f, ",{field}")?;
            }
        }

        if self.flags.is_empty() {
            write!(f, " {NO_FLAGS}")?;
        } else {
            let flags: Vec<&str> = self.flags.iter().map(String::as_str).collect();
            write!(f, " {}", flags.join(","))?;
        }

        write!(
            f,
            " {} {} {} {} {}",
            self.master_id.as_deref().unwrap_or(NO_MASTER),
            self.ping_sent,
            self.pong_recv,
            self.config_epoch,
            self.link_state.as_str()
        )?;
        for slot in &self.slots {
            write!(f, " {slot}")?;
        }
        Ok(())
    }
}

struct Endpoint {
    host: String,
    port: u16,
    bus_port: Option<u16>,
    hostname: Option<String>,
    aux: Vec<String>,
}

/// Split `<host>:<port>[@<bus-port>[,<hostname>[,<aux>...]]]`.
///
/// The port is taken after the last `:` so unbracketed IPv6 hosts survive. An empty
/// hostname slot means no hostname.
fn parse_address(field: &str) -> Result<Endpoint, String> {
    let (endpoint, bus) = match field.split_once('@') {
        Some((endpoint, bus)) => (endpoint, Some(bus)),
        None => (field, None),
    };

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| format!("address {field:?} has no port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port in {field:?}: {e}"))?;

    let mut parsed = Endpoint {
        host: host.to_string(),
        port,
        bus_port: None,
        hostname: None,
        aux: Vec::new(),
    };
    let Some(bus) = bus else {
        return Ok(parsed);
    };

    let mut parts = bus.split(',');
    let bus_port = parts.next().unwrap_or_default();
    parsed.bus_port = Some(
        bus_port
            .parse::<u16>()
            .map_err(|e| format!("invalid bus port in {field:?}: {e}"))?,
    );
    parsed.hostname = parts
        .next()
        .filter(|h| !h.is_empty())
        .map(str::to_string);
    parsed.aux = parts
        .filter(|aux| !aux.is_empty())
        .map(str::to_string)
        .collect();
    Ok(parsed)
}

fn parse_counter(line: &str, name: &str, value: &str) -> Result<u64, ParseError> {
    value
        .parse::<u64>()
        .map_err(|e| ParseError::new(line, format!("invalid {name} {value:?}: {e}")))
}

/// Parse a whole `CLUSTER NODES` reply, preserving line order.
pub fn parse_membership_table(
    raw: &str,
    mode: ParseMode,
) -> Result<Vec<NodeAttributes>, ParseError> {
    let mut table = Vec::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match NodeAttributes::parse(line) {
            Ok(attributes) => table.push(attributes),
            Err(e) if mode == ParseMode::Lenient => {
                warn!(error = %e, "Skipping malformed membership line");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF_LINE: &str = "9fd8800b31d569538917c0aaeaa5588e2f9c6edf 10.244.0.218:6379@16379 myself,master - 0 1652373716000 0 connected";

    const TABLE: &str = "335e5ceff013eeebdbdb71bb65b4c1aeaf6a06f5 10.244.0.156:6379@16379 master - 0 1652373719041 2 connected
9fd8800b31d569538917c0aaeaa5588e2f9c6edf 10.244.0.218:6379@16379 myself,master - 0 1652373716000 0 connected
8a99a71a38d099de6862284f5aab9329d796c34f 10.244.0.160:6379@16379 master - 0 1652373718026 1 connected
";

    #[test]
    fn test_parse_extracts_identity_and_address() {
        let attributes = NodeAttributes::parse(SELF_LINE).unwrap();
        assert_eq!(attributes.id(), "9fd8800b31d569538917c0aaeaa5588e2f9c6edf");
        assert_eq!(attributes.host(), "10.244.0.218");
        assert_eq!(attributes.port(), 6379);
        assert_eq!(attributes.bus_port(), Some(16379));
        assert_eq!(attributes.master_id(), None);
        assert_eq!(attributes.pong_recv(), 1652373716000);
        assert_eq!(attributes.link_state(), LinkState::Connected);
        assert!(attributes.is_self());
        assert_eq!(attributes.address(), NodeAddress::new("10.244.0.218", 6379));
    }

    #[test]
    fn test_has_flag_is_set_membership() {
        let attributes = NodeAttributes::parse(SELF_LINE).unwrap();
        assert!(attributes.has_flag("myself"));
        assert!(attributes.has_flag("master"));
        for absent in ["slave", "fail", "fail?", "handshake", "noaddr", "", "myself,master"] {
            assert!(!attributes.has_flag(absent), "unexpected flag {absent:?}");
        }
        assert_eq!(attributes.flags().len(), 2);
    }

    #[test]
    fn test_peer_line_is_not_self() {
        let line = "335e5ceff013eeebdbdb71bb65b4c1aeaf6a06f5 10.244.0.156:6379@16379 master - 0 1652373719041 2 connected";
        let attributes = NodeAttributes::parse(line).unwrap();
        assert!(!attributes.is_self());
        assert!(attributes.is_master());
        assert_eq!(attributes.config_epoch(), 2);
    }

    #[test]
    fn test_replica_with_slots_and_hostname() {
        let line = "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 10.0.0.9:6380@16380,redis-1.redis slave,fail? 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 1426238316232 1426238313000 3 disconnected 0-5460 [5461->-e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca]";
        let attributes = NodeAttributes::parse(line).unwrap();
        assert_eq!(attributes.hostname(), Some("redis-1.redis"));
        assert_eq!(
            attributes.master_id(),
            Some("67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1")
        );
        assert!(attributes.is_failing());
        assert!(!attributes.is_connected());
        assert_eq!(attributes.slots().len(), 2);
    }

    #[test]
    fn test_aux_fields_are_not_part_of_the_hostname() {
        let line = "69bc2c4a5e0c2a5d1e7f2f9a1c4b7f0b2c3d4e5f 127.0.0.1:30004@31004,,tls-port=0,shard-id=69bc2c4a5e0c2a5d1e7f2f9a1c4b7f0b2c3d4e5f master - 0 1426238317239 4 connected";
        let attributes = NodeAttributes::parse(line).unwrap();
        assert_eq!(attributes.hostname(), None);
        assert_eq!(attributes.bus_port(), Some(31004));
        assert_eq!(attributes.aux_fields().len(), 2);
        assert_eq!(attributes.aux("tls-port"), Some("0"));
        assert_eq!(
            attributes.aux("shard-id"),
            Some("69bc2c4a5e0c2a5d1e7f2f9a1c4b7f0b2c3d4e5f")
        );
        assert_eq!(attributes.aux("tls"), None);

        let named = "69bc2c4a5e0c2a5d1e7f2f9a1c4b7f0b2c3d4e5f 127.0.0.1:30004@31004,redis-0.redis,tls-port=0 master - 0 0 4 connected";
        let attributes = NodeAttributes::parse(named).unwrap();
        assert_eq!(attributes.hostname(), Some("redis-0.redis"));
        assert_eq!(attributes.aux_fields(), ["tls-port=0".to_string()]);
        assert_eq!(attributes.to_string(), named);
    }

    #[test]
    fn test_bootstrapping_node_has_empty_host() {
        let line = "07c37dfeb235213a872192d90877d0cd55635b91 :6379@16379 myself,master - 0 0 0 connected";
        let attributes = NodeAttributes::parse(line).unwrap();
        assert_eq!(attributes.host(), "");
        assert_eq!(attributes.port(), 6379);
        assert!(attributes.is_self());
    }

    #[test]
    fn test_noflags_and_missing_bus_port() {
        let line = "07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004 noflags - 0 1426238317239 4 connected";
        let attributes = NodeAttributes::parse(line).unwrap();
        assert!(attributes.flags().is_empty());
        assert_eq!(attributes.bus_port(), None);
    }

    #[test]
    fn test_ipv6_host() {
        let line = "07c37dfeb235213a872192d90877d0cd55635b91 fd00::12:6379@16379 master - 0 0 1 connected";
        let attributes = NodeAttributes::parse(line).unwrap();
        assert_eq!(attributes.host(), "fd00::12");
        assert_eq!(attributes.address().to_string(), "[fd00::12]:6379");
    }

    #[test]
    fn test_malformed_lines_name_the_line() {
        let cases = [
            "9fd8800b 10.244.0.218:6379@16379 myself,master",
            "9fd8800b 10.244.0.218@16379 master - 0 0 0 connected",
            "9fd8800b 10.244.0.218:http@16379 master - 0 0 0 connected",
            "9fd8800b 10.244.0.218:6379@bus master - 0 0 0 connected",
            "9fd8800b 10.244.0.218:6379@16379 master - soon 0 0 connected",
            "9fd8800b 10.244.0.218:6379@16379 master - 0 0 0 linked",
        ];
        for line in cases {
            let err = NodeAttributes::parse(line).unwrap_err();
            assert_eq!(err.line, line);
        }
    }

    #[test]
    fn test_parse_is_deterministic_and_display_round_trips() {
        let lines = [
            SELF_LINE,
            "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 10.0.0.9:6380@16380,redis-1.redis slave,fail? 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 1426238316232 1426238313000 3 disconnected 0-5460",
            "07c37dfeb235213a872192d90877d0cd55635b91 :6379@16379 myself,master - 0 0 0 connected",
            "07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004 noflags - 0 1426238317239 4 connected",
            "07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004,,tls-port=0,shard-id=07c37dfe master - 0 0 4 connected",
        ];
        for line in lines {
            let first = NodeAttributes::parse(line).unwrap();
            let second = NodeAttributes::parse(line).unwrap();
            assert_eq!(first, second);

            let canonical = first.to_string();
            let reparsed: NodeAttributes = canonical.parse().unwrap();
            assert_eq!(reparsed, first, "canonical form {canonical:?}");
        }
    }

    #[test]
    fn test_table_preserves_order() {
        let table = parse_membership_table(TABLE, ParseMode::Strict).unwrap();
        let ids: Vec<&str> = table.iter().map(NodeAttributes::id).collect();
        assert_eq!(
            ids,
            vec![
                "335e5ceff013eeebdbdb71bb65b4c1aeaf6a06f5",
                "9fd8800b31d569538917c0aaeaa5588e2f9c6edf",
                "8a99a71a38d099de6862284f5aab9329d796c34f",
            ]
        );
        assert_eq!(table.iter().filter(|n| n.is_self()).count(), 1);
    }

    #[test]
    fn test_lenient_table_skips_bad_lines() {
        let raw = format!("{TABLE}not a membership line\n\n");
        let lenient = parse_membership_table(&raw, ParseMode::Lenient).unwrap();
        assert_eq!(lenient.len(), 3);

        let strict = parse_membership_table(&raw, ParseMode::Strict).unwrap_err();
        assert_eq!(strict.line, "not a membership line");
    }

    mod properties {
        use proptest::{prelude::*, sample::subsequence};

        use super::*;

        fn host() -> impl Strategy<Value = String> {
            prop_oneof![
                Just(String::new()),
                (any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>())
                    .prop_map(|(a, b, c, d)| format!("{a}.{b}.{c}.{d}")),
                "fd00(:[0-9a-f]{1,4}){1,3}",
            ]
        }

        /// `@<bus>[,<hostname>[,<aux>...]]`, or nothing.
        fn bus_suffix() -> impl Strategy<Value = String> {
            proptest::option::of((
                any::<u16>(),
                "[a-z0-9.-]{0,12}",
                proptest::collection::vec("[a-z-]{1,8}=[a-z0-9]{0,8}", 0..3),
            ))
            .prop_map(|bus| match bus {
                None => String::new(),
                Some((port, hostname, aux)) if hostname.is_empty() && aux.is_empty() => {
                    format!("@{port}")
                }
                Some((port, hostname, aux)) => {
                    let mut suffix = format!("@{port},{hostname}");
                    for field in aux {
                        suffix.push(',');
                        suffix.push_str(&field);
                    }
                    suffix
                }
            })
        }

        fn flags() -> impl Strategy<Value = String> {
            subsequence(
                vec![
                    FLAG_MYSELF,
                    FLAG_MASTER,
                    FLAG_SLAVE,
                    FLAG_PFAIL,
                    FLAG_FAIL,
                    FLAG_HANDSHAKE,
                    FLAG_NOADDR,
                ],
                0..4,
            )
            .prop_map(|flags| {
                if flags.is_empty() {
                    NO_FLAGS.to_string()
                } else {
                    flags.join(",")
                }
            })
        }

        prop_compose! {
            fn membership_line()(
                id in "[0-9a-f]{40}",
                host in host(),
                port in any::<u16>(),
                bus in bus_suffix(),
                flags in flags(),
                master in proptest::option::of("[0-9a-f]{40}"),
                ping in any::<u64>(),
                pong in any::<u64>(),
                epoch in any::<u64>(),
                connected in any::<bool>(),
                slots in proptest::collection::vec("[0-9]{1,5}(-[0-9]{1,5})?", 0..4)
            ) -> String {
                let mut line = format!(
                    "{id} {host}:{port}{bus} {flags} {} {ping} {pong} {epoch} {}",
                    master.as_deref().unwrap_or(NO_MASTER),
                    if connected { "connected" } else { "disconnected" },
                );
                for slot in slots {
                    line.push(' ');
                    line.push_str(&slot);
                }
                line
            }
        }

        proptest! {
            #[test]
            fn prop_parse_is_pure_and_display_round_trips(line in membership_line()) {
                let first = NodeAttributes::parse(&line);
                prop_assert!(first.is_ok(), "failed to parse {:?}: {:?}", line, first);
                let first = first.unwrap();
                prop_assert_eq!(&NodeAttributes::parse(&line).unwrap(), &first);

                let reparsed = NodeAttributes::parse(&first.to_string()).unwrap();
                prop_assert_eq!(reparsed, first);
            }

            #[test]
            fn prop_has_flag_is_set_membership(
                line in membership_line(),
                candidate in "[a-z?]{0,10}",
            ) {
                let attributes = NodeAttributes::parse(&line).unwrap();
                prop_assert_eq!(
                    attributes.has_flag(&candidate),
                    attributes.flags().contains(&candidate)
                );
                prop_assert_eq!(attributes.is_self(), attributes.has_flag(FLAG_MYSELF));
            }
        }
    }
}
