//! The byte protocols spoken over the device nodes.

use std::os::fd::RawFd;

use dazukofs_core::{is_group_name_char, Verdict};

use crate::error::DeviceError;

/// Control writes of this size or larger are rejected.
pub const CTRL_WRITE_MAX: usize = 32;

/// Smallest buffer a group-device read accepts.
pub const GROUP_READ_MIN: usize = 43;

/// Only this many leading bytes of a verdict write are inspected.
pub(crate) const VERDICT_SCAN_WINDOW: usize = 18;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CtrlCommand {
    Add { name: String, tracking: bool },
    Del { name: String },
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extract the name following `key`, if the key occurs in the buffer. An
/// occurring key with an empty name is an error.
fn scan_name(buf: &[u8], key: &[u8]) -> Result<Option<String>, DeviceError> {
    let Some(at) = find_sub(buf, key) else {
        return Ok(None);
    };
    let rest = &buf[at + key.len()..];
    let len = rest.iter().take_while(|c| is_group_name_char(**c)).count();
    if len == 0 {
        return Err(DeviceError::BadCommand);
    }
    let name = std::str::from_utf8(&rest[..len])
        .map_err(|_| DeviceError::BadCommand)?
        .to_string();
    Ok(Some(name))
}

/// Parse one control write. A buffer may carry several commands; they are
/// returned in execution order: removals first, then plain adds, then
/// tracking adds. A buffer with no recognized command is an error.
pub(crate) fn parse_ctrl(buf: &[u8]) -> Result<Vec<CtrlCommand>, DeviceError> {
    let mut commands = Vec::new();
    if let Some(name) = scan_name(buf, b"del=")? {
        commands.push(CtrlCommand::Del { name });
    }
    if let Some(name) = scan_name(buf, b"add=")? {
        commands.push(CtrlCommand::Add {
            name,
            tracking: false,
        });
    }
    if let Some(name) = scan_name(buf, b"addtrack=")? {
        commands.push(CtrlCommand::Add {
            name,
            tracking: true,
        });
    }
    if commands.is_empty() {
        return Err(DeviceError::BadCommand);
    }
    Ok(commands)
}

/// Parse a verdict write: `id=<digits>` then `r=<byte>`, `0` meaning allow
/// and anything else deny. Number parsing stops at the first non-digit, so
/// trailing bytes are tolerated.
pub(crate) fn parse_verdict(buf: &[u8]) -> Result<(u64, Verdict), DeviceError> {
    let window = &buf[..buf.len().min(VERDICT_SCAN_WINDOW)];

    let id_at = find_sub(window, b"id=").ok_or(DeviceError::BadVerdict)?;
    let digits = &window[id_at + 3..];
    let digit_count = digits.iter().take_while(|c| c.is_ascii_digit()).count();
    let mut event_id: u64 = 0;
    for c in &digits[..digit_count] {
        event_id = event_id
            .checked_mul(10)
            .and_then(|id| id.checked_add(u64::from(c - b'0')))
            .ok_or(DeviceError::BadVerdict)?;
    }

    let rest = &digits[digit_count..];
    let r_at = find_sub(rest, b"r=").ok_or(DeviceError::BadVerdict)?;
    let response = rest.get(r_at + 2).ok_or(DeviceError::BadVerdict)?;
    let verdict = if *response == b'0' {
        Verdict::Allow
    } else {
        Verdict::Deny
    };
    Ok((event_id, verdict))
}

/// Render the line a group-device read hands to the claimant.
pub(crate) fn render_event_line(event_id: u64, fd: RawFd, pid: u32) -> String {
    format!("id={event_id}\nfd={fd}\npid={pid}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_commands() {
        assert_eq!(
            parse_ctrl(b"add=av").expect("parse"),
            vec![CtrlCommand::Add {
                name: "av".into(),
                tracking: false
            }]
        );
        assert_eq!(
            parse_ctrl(b"addtrack=scanner_1").expect("parse"),
            vec![CtrlCommand::Add {
                name: "scanner_1".into(),
                tracking: true
            }]
        );
        assert_eq!(
            parse_ctrl(b"del=av\n").expect("parse"),
            vec![CtrlCommand::Del { name: "av".into() }]
        );
    }

    #[test]
    fn test_parse_combined_write_orders_del_first() {
        let commands = parse_ctrl(b"add=fresh del=stale").expect("parse");
        assert_eq!(
            commands,
            vec![
                CtrlCommand::Del {
                    name: "stale".into()
                },
                CtrlCommand::Add {
                    name: "fresh".into(),
                    tracking: false
                },
            ]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_ctrl(b"").is_err());
        assert!(parse_ctrl(b"frobnicate").is_err());
        assert!(parse_ctrl(b"add=").is_err());
        assert!(parse_ctrl(b"del= no-name-here").is_err());
    }

    #[test]
    fn test_name_stops_at_first_invalid_byte() {
        assert_eq!(
            parse_ctrl(b"add=av;rm -rf").expect("parse"),
            vec![CtrlCommand::Add {
                name: "av".into(),
                tracking: false
            }]
        );
    }

    #[test]
    fn test_parse_verdict_allow_and_deny() {
        assert_eq!(
            parse_verdict(b"id=7\nr=0\n").expect("parse"),
            (7, Verdict::Allow)
        );
        assert_eq!(
            parse_verdict(b"id=12\nr=1\n").expect("parse"),
            (12, Verdict::Deny)
        );
        assert_eq!(
            parse_verdict(b"id=3\nr=9").expect("parse"),
            (3, Verdict::Deny)
        );
    }

    #[test]
    fn test_parse_verdict_tolerates_trailing_bytes() {
        assert_eq!(
            parse_verdict(b"id=5junk r=0 trailing").expect("parse"),
            (5, Verdict::Allow)
        );
    }

    #[test]
    fn test_parse_verdict_rejects_missing_fields() {
        assert!(parse_verdict(b"").is_err());
        assert!(parse_verdict(b"id=5\n").is_err());
        assert!(parse_verdict(b"r=0\n").is_err());
        assert!(parse_verdict(b"id=5\nr=").is_err());
    }

    #[test]
    fn test_verdict_window_ignores_bytes_past_it() {
        // The r= lands outside the scanned window.
        let mut line = b"id=123456789012\n   ".to_vec();
        line.extend_from_slice(b"r=0\n");
        assert!(parse_verdict(&line).is_err());
    }

    #[test]
    fn test_event_line_fits_minimum_buffer_for_common_values() {
        let line = render_event_line(1, 7, 4242);
        assert!(line.len() <= GROUP_READ_MIN);
        assert_eq!(line, "id=1\nfd=7\npid=4242\n");
    }
}
