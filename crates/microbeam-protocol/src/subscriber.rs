//! Subscriber stream messages.

use std::fmt;
use std::str::FromStr;

use microbeam_core::{DacPoint, RunId};

use crate::error::ProtocolError;

/// The only line a primary subscriber sends upstream.
pub const ACK: &str = "ack";

/// Lifecycle and position events broadcast to every subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberMessage {
    StartRun { id: RunId },
    Pos(DacPoint),
    StopRun,
    Abort,
}

impl SubscriberMessage {
    /// The line as written to the socket, including the terminator.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for SubscriberMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartRun { id } => write!(f, "start_run {id}"),
            Self::Pos(p) => write!(f, "pos {} {}", p.x, p.y),
            Self::StopRun => f.write_str("stop_run"),
            Self::Abort => f.write_str("abort"),
        }
    }
}

impl FromStr for SubscriberMessage {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let head = words.next().ok_or(ProtocolError::Empty)?;
        let malformed = |kind| ProtocolError::Malformed {
            kind,
            line: line.trim().to_string(),
        };

        let message = match head {
            "start_run" => {
                let id = words
                    .next()
                    .and_then(|w| w.parse::<u32>().ok())
                    .ok_or_else(|| malformed("start_run"))?;
                Self::StartRun { id: RunId::new(id) }
            }
            "pos" => {
                let mut coord = || words.next().and_then(|w| w.parse::<i16>().ok());
                match (coord(), coord()) {
                    (Some(x), Some(y)) => Self::Pos(DacPoint::new(x, y)),
                    _ => return Err(malformed("pos")),
                }
            }
            "stop_run" => Self::StopRun,
            "abort" => Self::Abort,
            other => return Err(ProtocolError::UnknownMessage(other.to_string())),
        };

        if words.next().is_some() {
            return Err(malformed(head_kind(&message)));
        }
        Ok(message)
    }
}

fn head_kind(message: &SubscriberMessage) -> &'static str {
    match message {
        SubscriberMessage::StartRun { .. } => "start_run",
        SubscriberMessage::Pos(_) => "pos",
        SubscriberMessage::StopRun => "stop_run",
        SubscriberMessage::Abort => "abort",
    }
}

/// True iff the line, trimmed, is exactly `ack`.
pub fn is_ack(line: &str) -> bool {
    line.trim() == ACK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines() {
        assert_eq!(
            SubscriberMessage::StartRun { id: RunId::new(7) }.to_line(),
            "start_run 7\n"
        );
        assert_eq!(
            SubscriberMessage::Pos(DacPoint::new(-100, 0)).to_line(),
            "pos -100 0\n"
        );
        assert_eq!(SubscriberMessage::StopRun.to_line(), "stop_run\n");
        assert_eq!(SubscriberMessage::Abort.to_line(), "abort\n");
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "pos 50 -32768\n".parse::<SubscriberMessage>().unwrap(),
            SubscriberMessage::Pos(DacPoint::new(50, -32768))
        );
        assert_eq!(
            "start_run 0".parse::<SubscriberMessage>().unwrap(),
            SubscriberMessage::StartRun { id: RunId::new(0) }
        );
        assert_eq!(
            "  abort ".parse::<SubscriberMessage>().unwrap(),
            SubscriberMessage::Abort
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<SubscriberMessage>(), Err(ProtocolError::Empty));
        assert!(matches!(
            "pos 1".parse::<SubscriberMessage>(),
            Err(ProtocolError::Malformed { kind: "pos", .. })
        ));
        assert!(matches!(
            "pos 1 2 3".parse::<SubscriberMessage>(),
            Err(ProtocolError::Malformed { kind: "pos", .. })
        ));
        assert!(matches!(
            "hello".parse::<SubscriberMessage>(),
            Err(ProtocolError::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_is_ack() {
        assert!(is_ack("ack"));
        assert!(is_ack("ack\r\n"));
        assert!(is_ack("  ack  "));
        assert!(!is_ack("ACK"));
        assert!(!is_ack("ack ack"));
        assert!(!is_ack(""));
    }
}
