//! Gateway opcodes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOpcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl GatewayOpcode {
    pub fn from_code(code: u64) -> Option<GatewayOpcode> {
        match code {
            0 => Some(GatewayOpcode::Dispatch),
            1 => Some(GatewayOpcode::Heartbeat),
            2 => Some(GatewayOpcode::Identify),
            3 => Some(GatewayOpcode::PresenceUpdate),
            4 => Some(GatewayOpcode::VoiceStateUpdate),
            6 => Some(GatewayOpcode::Resume),
            7 => Some(GatewayOpcode::Reconnect),
            8 => Some(GatewayOpcode::RequestGuildMembers),
            9 => Some(GatewayOpcode::InvalidSession),
            10 => Some(GatewayOpcode::Hello),
            11 => Some(GatewayOpcode::HeartbeatAck),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            GatewayOpcode::Dispatch => 0,
            GatewayOpcode::Heartbeat => 1,
            GatewayOpcode::Identify => 2,
            GatewayOpcode::PresenceUpdate => 3,
            GatewayOpcode::VoiceStateUpdate => 4,
            GatewayOpcode::Resume => 6,
            GatewayOpcode::Reconnect => 7,
            GatewayOpcode::RequestGuildMembers => 8,
            GatewayOpcode::InvalidSession => 9,
            GatewayOpcode::Hello => 10,
            GatewayOpcode::HeartbeatAck => 11,
        }
    }
}

impl fmt::Display for GatewayOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip_and_gap_at_five() {
        for code in 0..=11u64 {
            match GatewayOpcode::from_code(code) {
                Some(op) => assert_eq!(u64::from(op.code()), code),
                None => assert_eq!(code, 5),
            }
        }
        assert_eq!(GatewayOpcode::from_code(12), None);
    }

    #[test]
    fn test_display_names_the_opcode() {
        assert_eq!(GatewayOpcode::Hello.to_string(), "Hello(10)");
    }
}
