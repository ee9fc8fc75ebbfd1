use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ipnet::Ipv4Net;
use strum_macros::EnumString;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[strum(serialize_all = "snake_case")]
/// A packet header field.
///
/// The named variants are the *compilable* headers a switch can match and
/// rewrite, plus the content metadata carried alongside a packet. Every other
/// name is a [virtual field](Field::Virtual), registered at runtime and
/// encoded into the VLAN headers before rule installation.
pub enum Field {
    // basic headers
    Srcmac,
    Dstmac,
    Srcip,
    Dstip,
    Tos,
    Srcport,
    Dstport,
    Ethtype,
    Protocol,

    // tagging headers
    VlanId,
    VlanPcp,

    // location
    Switch,
    Inport,
    Outport,

    // content metadata
    Raw,
    HeaderLen,
    PayloadLen,

    #[strum(default)]
    /// A logical per-packet field registered at runtime.
    Virtual(String),
}

/// The basic packet headers.
pub const BASIC_HEADERS: [Field; 9] = [
    Field::Srcmac,
    Field::Dstmac,
    Field::Srcip,
    Field::Dstip,
    Field::Tos,
    Field::Srcport,
    Field::Dstport,
    Field::Ethtype,
    Field::Protocol,
];

/// The VLAN headers used as carrier space for virtual fields.
pub const TAGGING_HEADERS: [Field; 2] = [Field::VlanId, Field::VlanPcp];

/// The location pseudo-headers of a located packet.
pub const LOCATION_HEADERS: [Field; 3] = [Field::Switch, Field::Inport, Field::Outport];

/// The content metadata fields. Not installable on a switch.
pub const CONTENT_HEADERS: [Field; 3] = [Field::Raw, Field::HeaderLen, Field::PayloadLen];

impl Field {
    /// Whether rules over this field can be installed on a switch.
    pub fn is_compilable(&self) -> bool {
        !matches!(
            self,
            Field::Raw | Field::HeaderLen | Field::PayloadLen | Field::Virtual(_)
        )
    }

    /// Whether this is a runtime-registered virtual field.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Field::Virtual(_))
    }

    /// Whether values of this field are IPv4 prefixes compared by containment.
    pub fn is_cidr(&self) -> bool {
        matches!(self, Field::Srcip | Field::Dstip)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Srcmac => "srcmac",
            Field::Dstmac => "dstmac",
            Field::Srcip => "srcip",
            Field::Dstip => "dstip",
            Field::Tos => "tos",
            Field::Srcport => "srcport",
            Field::Dstport => "dstport",
            Field::Ethtype => "ethtype",
            Field::Protocol => "protocol",
            Field::VlanId => "vlan_id",
            Field::VlanPcp => "vlan_pcp",
            Field::Switch => "switch",
            Field::Inport => "inport",
            Field::Outport => "outport",
            Field::Raw => "raw",
            Field::HeaderLen => "header_len",
            Field::PayloadLen => "payload_len",
            Field::Virtual(name) => name,
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
/// A field value, or the pattern a match constrains a field with.
///
/// In a match, [`Value::None`] requires the field to be absent; in a modify it
/// clears the field. `srcip`/`dstip` patterns are CIDR prefixes; a concrete
/// host address is the /32 prefix.
pub enum Value {
    /// An integer value (ports, switch ids, VLAN bits, lengths).
    Int(u64),
    /// An Ethernet address.
    Mac([u8; 6]),
    /// An IPv4 prefix. Host values are /32.
    Ip(Ipv4Net),
    /// Raw packet content.
    Bytes(Vec<u8>),
    /// Field absent (match) or cleared (modify).
    None,
}

impl Value {
    /// Parse a value literal: an integer, an IPv4 address or prefix, or a
    /// colon-separated MAC address.
    pub fn parse(s: &str) -> Result<Value, ValueParseError> {
        if let Ok(n) = s.parse::<u64>() {
            return Ok(Value::Int(n));
        }
        if let Ok(net) = s.parse::<Ipv4Net>() {
            return Ok(Value::Ip(net));
        }
        if let Ok(addr) = s.parse::<std::net::Ipv4Addr>() {
            return Ok(Value::Ip(
                Ipv4Net::new(addr, 32).expect("/32 is a valid prefix length"),
            ));
        }
        if s.contains(':') {
            let parts: Vec<&str> = s.split(':').collect();
            if parts.len() == 6 {
                let mut mac = [0u8; 6];
                for (i, p) in parts.iter().enumerate() {
                    mac[i] =
                        u8::from_str_radix(p, 16).map_err(|_| ValueParseError(s.to_string()))?;
                }
                return Ok(Value::Mac(mac));
            }
        }
        Err(ValueParseError(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized value literal {0:?}")]
pub struct ValueParseError(pub String);

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Mac(m) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                m[0], m[1], m[2], m[3], m[4], m[5]
            ),
            Value::Ip(net) => write!(f, "{net}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::None => f.write_str("none"),
        }
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Value {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Value {
        Value::Int(n.into())
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Value {
        Value::Int(n.into())
    }
}

impl From<i32> for Value {
    /// Convenience for integer literals; panics on negative input.
    fn from(n: i32) -> Value {
        Value::Int(u64::try_from(n).expect("field values are non-negative"))
    }
}

impl From<Ipv4Net> for Value {
    fn from(net: Ipv4Net) -> Value {
        Value::Ip(net)
    }
}

impl From<&str> for Value {
    /// Convenience for building field maps from literals; panics on input
    /// that is not a value literal. Use [`Value::parse`] for fallible parsing.
    fn from(s: &str) -> Value {
        Value::parse(s).expect("value literal")
    }
}

/// A finite assignment of fields to values, used by matches and modifies.
pub type FieldMap = BTreeMap<Field, Value>;

/// Build a [`FieldMap`] from `(name, value)` pairs. Names that are not
/// recognized headers become virtual fields.
pub fn field_map<I, V>(pairs: I) -> FieldMap
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(name, v)| {
            (
                Field::from_str(name).expect("field names always parse"),
                v.into(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_round_trip() {
        for f in BASIC_HEADERS
            .iter()
            .chain(TAGGING_HEADERS.iter())
            .chain(LOCATION_HEADERS.iter())
            .chain(CONTENT_HEADERS.iter())
        {
            let parsed = Field::from_str(&f.to_string()).unwrap();
            assert_eq!(&parsed, f);
        }
    }

    #[test]
    fn unknown_names_become_virtual() {
        let f = Field::from_str("path_tag").unwrap();
        assert_eq!(f, Field::Virtual("path_tag".to_string()));
        assert!(!f.is_compilable());
        assert_eq!(f.to_string(), "path_tag");
    }

    #[test]
    fn value_literals() {
        assert_eq!(Value::parse("80").unwrap(), Value::Int(80));
        assert_eq!(
            Value::parse("10.0.0.0/24").unwrap(),
            Value::Ip("10.0.0.0/24".parse().unwrap())
        );
        assert_eq!(
            Value::parse("10.0.0.5").unwrap(),
            Value::Ip("10.0.0.5/32".parse().unwrap())
        );
        assert_eq!(
            Value::parse("0a:1b:2c:3d:4e:5f").unwrap(),
            Value::Mac([0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f])
        );
        assert!(Value::parse("bogus").is_err());
    }
}
