// SPDX-License-Identifier: MPL-2.0

//! MQTT 5.0 reason codes used by PUBACK, PUBREC, PUBREL, PUBCOMP and DISCONNECT.

pub const SUCCESS: u8 = 0x00;
pub const NO_MATCHING_SUBSCRIBERS: u8 = 0x10;
pub const UNSPECIFIED_ERROR: u8 = 0x80;
pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
pub const NOT_AUTHORIZED: u8 = 0x87;
pub const PROTOCOL_ERROR: u8 = 0x82;
pub const TOPIC_NAME_INVALID: u8 = 0x90;
pub const PACKET_IDENTIFIER_IN_USE: u8 = 0x91;
pub const PACKET_IDENTIFIER_NOT_FOUND: u8 = 0x92;
pub const QUOTA_EXCEEDED: u8 = 0x97;
pub const PAYLOAD_FORMAT_INVALID: u8 = 0x99;

/// Reason codes of 0x80 and above signal failure (MQTT 5.0, 2.4).
pub fn is_error(reason_code: u8) -> bool {
    reason_code >= 0x80
}

/// Human readable name of a publish-acknowledgment or disconnect reason code.
pub fn describe(reason_code: u8) -> &'static str {
    match reason_code {
        SUCCESS => "Success",
        NO_MATCHING_SUBSCRIBERS => "No matching subscribers",
        UNSPECIFIED_ERROR => "Unspecified error",
        PROTOCOL_ERROR => "Protocol error",
        IMPLEMENTATION_SPECIFIC_ERROR => "Implementation specific error",
        NOT_AUTHORIZED => "Not authorized",
        TOPIC_NAME_INVALID => "Topic Name invalid",
        PACKET_IDENTIFIER_IN_USE => "Packet Identifier in use",
        PACKET_IDENTIFIER_NOT_FOUND => "Packet Identifier not found",
        QUOTA_EXCEEDED => "Quota exceeded",
        PAYLOAD_FORMAT_INVALID => "Payload format invalid",
        _ => "Unknown reason code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_boundary() {
        assert!(!is_error(SUCCESS));
        assert!(!is_error(NO_MATCHING_SUBSCRIBERS));
        assert!(is_error(UNSPECIFIED_ERROR));
        assert!(is_error(QUOTA_EXCEEDED));
        assert_eq!(describe(PACKET_IDENTIFIER_NOT_FOUND), "Packet Identifier not found");
        assert_eq!(describe(0x7f), "Unknown reason code");
    }
}
