//! ASCII wire codec. Every packet is one datagram of whitespace separated tokens with a
//! leading type tag; free-form message content is always the packet tail so it may carry
//! spaces. The format is kept bit-exact with peers of any implementation, which is why
//! parsing lives here and the rest of the crate only ever sees the tagged variants.
use std::fmt;
use thiserror::Error;

/// Destination pseudo-address for packets going to the local subnet (JOIN, HEART_BEAT).
pub const BROADCAST: &str = "255.255.255.255";

/// One view entry, e.g where a peer can be reached and who it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub ip: String,
    pub id: u8,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.ip)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Application payload, unicast by the originator to every view member.
    Msg { seq: u64, sender: u8, content: String },
    /// Acknowledgement of `seq`, unicast to every view member including self.
    Ack { seq: u64, sender: u8 },
    /// Admission request, broadcast once at startup by a non-coordinator.
    Join { id: u8, ip: String },
    /// Proposed next view, unicast by the coordinator.
    ViewChange { origin: u8, members: Vec<Member> },
    /// Flush confirmation for the view change in progress.
    Flush { sender: u8 },
    /// Commit of the proposed view, unicast by the coordinator.
    InstallView { origin: u8 },
    /// Liveness beacon, broadcast by followers.
    HeartBeat { sender: u8, ip: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("empty packet")]
    Empty,
    #[error("unknown tag `{0}`")]
    UnknownTag(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{0}`")]
    InvalidField(&'static str),
}

use self::WireError::*;

fn field<T>(token: Option<&str>, name: &'static str) -> Result<T, WireError>
where
    T: std::str::FromStr,
{
    token
        .ok_or(MissingField(name))?
        .parse()
        .map_err(|_| InvalidField(name))
}

impl Packet {
    /// Render the packet as its wire line.
    pub fn encode(&self) -> String {
        match self {
            Packet::Msg {
                seq,
                sender,
                content,
            } => format!("MSG {} {} {}", seq, sender, content),
            Packet::Ack { seq, sender } => format!("ACK {} {}", seq, sender),
            Packet::Join { id, ip } => format!("JOIN {} {}", id, ip),
            Packet::ViewChange { origin, members } => {
                let mut line = format!("VIEW_CHANGE {}", origin);
                for member in members {
                    line.push_str(&format!(" {} {}", member.ip, member.id));
                }
                line
            }
            Packet::Flush { sender } => format!("FLUSH {}", sender),
            Packet::InstallView { origin } => format!("INSTALL_VIEW {}", origin),
            Packet::HeartBeat { sender, ip } => format!("HEART_BEAT {} {}", sender, ip),
        }
    }

    /// Parse one datagram. Anything that does not scan cleanly comes back as a
    /// typed error and is meant to be dropped by the caller.
    pub fn decode(raw: &str) -> Result<Packet, WireError> {
        let raw = raw.trim_end();
        let mut split = raw.splitn(2, ' ');
        let tag = split.next().filter(|tag| !tag.is_empty()).ok_or(Empty)?;
        let rest = split.next().unwrap_or("");
        match tag {
            "MSG" => {
                let mut tokens = rest.splitn(3, ' ');
                Ok(Packet::Msg {
                    seq: field(tokens.next(), "seq_num")?,
                    sender: field(tokens.next(), "sender_id")?,
                    content: tokens.next().unwrap_or("").to_string(),
                })
            }
            "ACK" => {
                let mut tokens = rest.split_whitespace();
                Ok(Packet::Ack {
                    seq: field(tokens.next(), "seq_num")?,
                    sender: field(tokens.next(), "sender_id")?,
                })
            }
            "JOIN" => {
                let mut tokens = rest.split_whitespace();
                Ok(Packet::Join {
                    id: field(tokens.next(), "process_id")?,
                    ip: field(tokens.next(), "ip_address")?,
                })
            }
            "VIEW_CHANGE" => {
                let mut tokens = rest.split_whitespace();
                let origin = field(tokens.next(), "origin_id")?;
                let mut members = Vec::new();
                loop {
                    match (tokens.next(), tokens.next()) {
                        (Some(ip), Some(id)) => members.push(Member {
                            ip: ip.to_string(),
                            id: id.parse().map_err(|_| InvalidField("process_id"))?,
                        }),
                        (Some(_), None) => return Err(MissingField("process_id")),
                        _ => break,
                    }
                }
                Ok(Packet::ViewChange { origin, members })
            }
            "FLUSH" => {
                let mut tokens = rest.split_whitespace();
                Ok(Packet::Flush {
                    sender: field(tokens.next(), "sender_id")?,
                })
            }
            "INSTALL_VIEW" => {
                let mut tokens = rest.split_whitespace();
                Ok(Packet::InstallView {
                    origin: field(tokens.next(), "origin_id")?,
                })
            }
            "HEART_BEAT" => {
                let mut tokens = rest.split_whitespace();
                Ok(Packet::HeartBeat {
                    sender: field(tokens.next(), "sender_id")?,
                    ip: field(tokens.next(), "ip_address")?,
                })
            }
            _ => Err(UnknownTag(tag.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn msg_content_keeps_spaces() {
        let packet = Packet::decode("MSG 12 3 hello  there world").unwrap();
        assert_eq!(
            packet,
            Packet::Msg {
                seq: 12,
                sender: 3,
                content: "hello  there world".to_string(),
            }
        );
        assert_eq!(packet.encode(), "MSG 12 3 hello  there world");
    }

    #[test]
    fn msg_empty_content() {
        let packet = Packet::decode("MSG 0 1").unwrap();
        assert_eq!(
            packet,
            Packet::Msg {
                seq: 0,
                sender: 1,
                content: String::new(),
            }
        );
    }

    #[test]
    fn view_change_members() {
        let raw = "VIEW_CHANGE 0 10.0.0.1 0 10.0.0.2 1";
        let packet = Packet::decode(raw).unwrap();
        match &packet {
            Packet::ViewChange { origin, members } => {
                assert_eq!(*origin, 0);
                assert_eq!(members.len(), 2);
                assert_eq!(members[1].ip, "10.0.0.2");
                assert_eq!(members[1].id, 1);
            }
            _ => panic!("wrong variant"),
        }
        assert_eq!(packet.encode(), raw);
    }

    #[test]
    fn view_change_empty_membership() {
        let packet = Packet::decode("VIEW_CHANGE 0").unwrap();
        assert_eq!(
            packet,
            Packet::ViewChange {
                origin: 0,
                members: Vec::new(),
            }
        );
    }

    #[test]
    fn simple_tags() {
        assert_eq!(
            Packet::decode("ACK 7 2").unwrap(),
            Packet::Ack { seq: 7, sender: 2 }
        );
        assert_eq!(
            Packet::decode("JOIN 1 192.168.1.17").unwrap(),
            Packet::Join {
                id: 1,
                ip: "192.168.1.17".to_string(),
            }
        );
        assert_eq!(Packet::decode("FLUSH 4").unwrap(), Packet::Flush { sender: 4 });
        assert_eq!(
            Packet::decode("INSTALL_VIEW 0").unwrap(),
            Packet::InstallView { origin: 0 }
        );
        assert_eq!(
            Packet::decode("HEART_BEAT 2 10.0.0.3").unwrap(),
            Packet::HeartBeat {
                sender: 2,
                ip: "10.0.0.3".to_string(),
            }
        );
    }

    #[test]
    fn malformed_packets() {
        assert_eq!(Packet::decode(""), Err(WireError::Empty));
        assert_eq!(
            Packet::decode("NOPE 1 2"),
            Err(WireError::UnknownTag("NOPE".to_string()))
        );
        assert_eq!(
            Packet::decode("ACK x 2"),
            Err(WireError::InvalidField("seq_num"))
        );
        assert_eq!(
            Packet::decode("MSG 5"),
            Err(WireError::MissingField("sender_id"))
        );
        assert_eq!(
            Packet::decode("VIEW_CHANGE 0 10.0.0.1"),
            Err(WireError::MissingField("process_id"))
        );
        assert_eq!(
            Packet::decode("HEART_BEAT 400 10.0.0.3"),
            Err(WireError::InvalidField("sender_id"))
        );
    }
}
