//! Control-protocol messages shared by the server and the client.
//!
//! Every message is a flat record serialized as a JSON object. On the wire it
//! is preceded by a one-byte type tag and an 8-byte big-endian payload length
//! (see [`codec`]). The tag table is closed: every [`Message`] variant has
//! exactly one tag and every tag decodes to exactly one variant.
//!
//! | Tag   | Message               | Direction                          |
//! |-------|-----------------------|------------------------------------|
//! | `'o'` | `Login`               | client → server                    |
//! | `'1'` | `LoginResp`           | server → client                    |
//! | `'p'` | `RegisterTunnel`      | client → server                    |
//! | `'2'` | `RegisterTunnelResp`  | server → client                    |
//! | `'c'` | `CloseTunnel`         | either                             |
//! | `'w'` | `NewWorkConn`         | client → server (new connection)   |
//! | `'r'` | `ReqWorkConn`         | server → client                    |
//! | `'s'` | `StartWorkConn`       | server → client (work connection)  |
//! | `'h'` | `Ping`                | client → server                    |
//! | `'4'` | `Pong`                | server → client                    |

pub mod codec;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use codec::{decode, encode, read_msg, write_msg, CodecError, MsgCodec, DEFAULT_MAX_MSG_LEN};

/// Version string sent in `Login` and `LoginResp`.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kind of a logical tunnel. Only `tcp` has a data plane in this crate; the
/// others travel through the control protocol unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    #[default]
    Tcp,
    Udp,
    Http,
    Https,
    Stcp,
    Xtcp,
}

impl TunnelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Https => "https",
            Self::Stcp => "stcp",
            Self::Xtcp => "xtcp",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First message on a control connection.
///
/// An empty `run_id` asks for a new session; a non-empty one resumes (and
/// replaces) the session with that id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Login {
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub user: String,
    pub privilege_key: String,
    pub timestamp: i64,
    pub run_id: String,
    /// Number of idle work connections the client wants the server to keep.
    pub pool_count: u32,
    pub metas: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    /// Non-empty when the login was rejected.
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterTunnel {
    pub tunnel_name: String,
    pub tunnel_kind: TunnelKind,
    pub use_encryption: bool,
    pub use_compression: bool,
    pub remote_port: u16,
    pub custom_domains: Vec<String>,
    pub subdomain: String,
    pub secret_key: String,
    pub metas: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterTunnelResp {
    pub tunnel_name: String,
    /// Public address users connect to, e.g. `":9000"`.
    pub public_addr: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseTunnel {
    pub tunnel_name: String,
}

/// First message on a freshly dialed work connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWorkConn {
    pub run_id: String,
    pub privilege_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqWorkConn {}

/// Written by the server on a claimed work connection to bind it to a tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartWorkConn {
    pub tunnel_name: String,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    pub privilege_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pong {
    pub error: String,
}

/// Declares [`Message`] together with its tag table, so the tag → shape
/// mapping cannot drift from the enum.
macro_rules! message_table {
    ($($variant:ident = $tag:literal),+ $(,)?) => {
        /// A control-protocol message.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $($variant($variant),)+
        }

        impl Message {
            /// The one-byte wire tag of this message.
            pub fn type_byte(&self) -> u8 {
                match self {
                    $(Message::$variant(_) => $tag,)+
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Message::$variant(_) => stringify!($variant),)+
                }
            }

            /// Whether `tag` names a registered message type.
            pub fn is_known_tag(tag: u8) -> bool {
                matches!(tag, $($tag)|+)
            }

            pub(crate) fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
                match self {
                    $(Message::$variant(m) => serde_json::to_vec(m),)+
                }
            }

            /// `None` if the tag is not registered.
            pub(crate) fn from_payload(tag: u8, payload: &[u8]) -> Option<serde_json::Result<Message>> {
                match tag {
                    $($tag => Some(serde_json::from_slice(payload).map(Message::$variant)),)+
                    _ => None,
                }
            }
        }

        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )+
    };
}

message_table! {
    Login = b'o',
    LoginResp = b'1',
    RegisterTunnel = b'p',
    RegisterTunnelResp = b'2',
    CloseTunnel = b'c',
    NewWorkConn = b'w',
    ReqWorkConn = b'r',
    StartWorkConn = b's',
    Ping = b'h',
    Pong = b'4',
}

/// Whether a peer speaking `peer` can talk to us.
///
/// Major versions must match; while the major version is 0 the minor must
/// match too.
pub fn is_compatible(peer: &str) -> bool {
    fn major_minor(v: &str) -> Option<(u64, u64)> {
        let mut parts = v.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        Some((major, minor))
    }

    match (major_minor(peer), major_minor(PROTOCOL_VERSION)) {
        (Some((pm, _)), Some((om, _))) if pm != om => false,
        (Some((0, pn)), Some((0, on))) => pn == on,
        (Some(_), Some(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_distinct() {
        let samples: Vec<Message> = vec![
            Login::default().into(),
            LoginResp::default().into(),
            RegisterTunnel::default().into(),
            RegisterTunnelResp::default().into(),
            CloseTunnel::default().into(),
            NewWorkConn::default().into(),
            ReqWorkConn::default().into(),
            StartWorkConn::default().into(),
            Ping::default().into(),
            Pong::default().into(),
        ];
        let mut tags: Vec<u8> = samples.iter().map(Message::type_byte).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), samples.len());
        assert!(tags.iter().all(|t| Message::is_known_tag(*t)));
        assert!(!Message::is_known_tag(b'z'));
    }

    #[test]
    fn test_tunnel_kind_serializes_lowercase() {
        let json = serde_json::to_string(&TunnelKind::Https).unwrap();
        assert_eq!(json, "\"https\"");
        let kind: TunnelKind = serde_json::from_str("\"stcp\"").unwrap();
        assert_eq!(kind, TunnelKind::Stcp);
    }

    #[test]
    fn test_missing_fields_default() {
        let msg = Message::from_payload(b'p', br#"{"tunnel_name":"web"}"#)
            .unwrap()
            .unwrap();
        let Message::RegisterTunnel(reg) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(reg.tunnel_name, "web");
        assert_eq!(reg.tunnel_kind, TunnelKind::Tcp);
        assert_eq!(reg.remote_port, 0);
    }

    #[test]
    fn test_is_compatible_same_version() {
        assert!(is_compatible(PROTOCOL_VERSION));
    }

    #[test]
    fn test_is_compatible_rejects_garbage_and_other_major() {
        assert!(!is_compatible(""));
        assert!(!is_compatible("not-a-version"));
        assert!(!is_compatible("99.0.0"));
    }
}
