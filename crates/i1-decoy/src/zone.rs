//! Zone file encoding for the block set.
//!
//! The file is a fixed preamble followed by a sentinel comment and one
//! record per blocked address:
//!
//! ```text
//! $TTL    60
//! @       IN SOA     honeypot.localhost. noc.localhost. (
//!              2610191432         ; Serial
//!              ...
//! @       IN NS      localhost.
//!
//! ;HONEYPOT
//! blocked	IN	A	203.0.113.7
//! blocked	IN	AAAA	2001:db8::7
//! ```
//!
//! Everything before the sentinel is regenerated on every write. Everything
//! after it is the block set; on load, field 3 of each tab-separated line
//! is read back as an address.

use chrono::{DateTime, Local, TimeZone};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

use crate::config::ZoneSettings;
use crate::DecoyError;

/// Marker line separating the preamble from the block records.
pub const SENTINEL: &str = ";HONEYPOT";

/// Blocklist recovered from an existing zone file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedZone {
    /// SOA serial found in the preamble, if any.
    pub serial: Option<u32>,
    /// Blocked addresses in file order, duplicates removed.
    pub blocked: Vec<IpAddr>,
    /// Lines after the sentinel with 4+ fields whose address did not parse.
    pub skipped: usize,
}

/// Minute-resolution serial `YYMMDDHHMM` for the given local time.
pub fn clock_serial<Tz: TimeZone>(now: &DateTime<Tz>) -> crate::Result<u32>
where
    Tz::Offset: std::fmt::Display,
{
    let text = now.format("%y%m%d%H%M").to_string();
    text.parse()
        .map_err(|e| DecoyError::Zone(format!("serial '{text}' out of range: {e}")))
}

/// Serial for the next write: the clock serial, but always past `last`.
pub fn next_serial(now: &DateTime<Local>, last: Option<u32>) -> crate::Result<u32> {
    let clock = clock_serial(now)?;
    match last {
        Some(last) if clock <= last => {
            if clock < last {
                warn!(clock, last, "zone serial clock is behind the last written serial");
            }
            last.checked_add(1)
                .ok_or_else(|| DecoyError::Zone("zone serial exhausted".into()))
        }
        _ => Ok(clock),
    }
}

/// Render a full zone file for the given block set.
pub fn render(settings: &ZoneSettings, serial: u32, blocked: &[IpAddr]) -> String {
    let mut out = preamble(settings, serial);
    out.reserve(blocked.len() * 32);

    for ip in blocked {
        let rtype = match ip {
            IpAddr::V4(_) => "A",
            IpAddr::V6(_) => "AAAA",
        };
        out.push_str(&format!("{}\tIN\t{rtype}\t{ip}\n", settings.record_name));
    }

    out
}

/// Everything up to and including the sentinel line.
fn preamble(settings: &ZoneSettings, serial: u32) -> String {
    [
        format!("$TTL    {}", settings.ttl),
        format!(
            "@       IN SOA     {} {} (",
            settings.primary_ns, settings.admin_mailbox
        ),
        format!("             {serial}         ; Serial"),
        format!("             {} ; Refresh", settings.refresh),
        format!("             {} ; Retry", settings.retry),
        format!("             {} ; Expire", settings.expire),
        format!(
            "             {} ) ; Negative Cache TTL",
            settings.negative_ttl
        ),
        format!("@       IN NS      {}", settings.nameserver),
        String::new(),
        SENTINEL.to_string(),
        String::new(),
    ]
    .join("\n")
}

/// Parse a zone file written by [`render`] (or by hand in the same shape).
pub fn parse(content: &str) -> ParsedZone {
    let mut lines = content.lines();
    let mut serial = None;

    for line in lines.by_ref() {
        let line = line.trim_end_matches('\r');
        if line == SENTINEL {
            break;
        }
        if serial.is_none() && line.contains("; Serial") {
            serial = line.split_whitespace().next().and_then(|s| s.parse().ok());
        }
    }

    let mut seen = BTreeSet::new();
    let mut blocked = Vec::new();
    let mut skipped = 0;

    for line in lines {
        let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
        if fields.len() < 4 {
            continue;
        }
        match fields[3].trim().parse::<IpAddr>() {
            Ok(ip) => {
                // Same key the listener uses for IPv4-mapped peers.
                let ip = ip.to_canonical();
                if seen.insert(ip) {
                    blocked.push(ip);
                }
            }
            Err(_) => {
                warn!(line = %line, "skipping unparseable block record");
                skipped += 1;
            }
        }
    }

    ParsedZone {
        serial,
        blocked,
        skipped,
    }
}

/// Read the persisted blocklist.
///
/// A missing file is a fresh start and yields an empty blocklist; any other
/// read failure is an error.
pub fn load(path: &Path) -> crate::Result<ParsedZone> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ParsedZone::default()),
        Err(e) => Err(DecoyError::Blocklist(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_clock_serial_is_zero_padded() {
        let at = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 0).unwrap();
        assert_eq!(clock_serial(&at).unwrap(), 2_603_040_506);
    }

    #[test]
    fn test_next_serial_never_goes_backwards() {
        let at = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 0).unwrap();
        assert_eq!(next_serial(&at, None).unwrap(), 2_603_040_506);
        assert_eq!(next_serial(&at, Some(2_603_040_000)).unwrap(), 2_603_040_506);
        // Same minute.
        assert_eq!(next_serial(&at, Some(2_603_040_506)).unwrap(), 2_603_040_507);
        // Clock went backwards.
        assert_eq!(next_serial(&at, Some(2_612_310_000)).unwrap(), 2_612_310_001);
    }

    #[test]
    fn test_render_layout() {
        let text = render(
            &ZoneSettings::default(),
            2_610_191_432,
            &[v4(1, 2, 3, 4), v4(10, 0, 0, 1)],
        );
        assert!(text.starts_with("$TTL    60\n"));
        assert!(text.contains("@       IN SOA     honeypot.localhost. noc.localhost. (\n"));
        assert!(text.contains("2610191432         ; Serial"));
        assert!(text.contains("@       IN NS      localhost.\n"));
        assert!(text.ends_with(";HONEYPOT\nblocked\tIN\tA\t1.2.3.4\nblocked\tIN\tA\t10.0.0.1\n"));
    }

    #[test]
    fn test_render_ipv6_as_aaaa() {
        let ip = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7));
        let text = render(&ZoneSettings::default(), 1, &[ip]);
        assert!(text.contains("blocked\tIN\tAAAA\t2001:db8::7\n"));
    }

    #[test]
    fn test_render_empty_block_set() {
        let text = render(&ZoneSettings::default(), 1, &[]);
        assert!(text.ends_with(";HONEYPOT\n"));
        assert!(parse(&text).blocked.is_empty());
    }

    #[test]
    fn test_parse_recovers_block_set_and_serial() {
        let blocked = vec![
            v4(192, 0, 2, 1),
            v4(198, 51, 100, 2),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];
        let text = render(&ZoneSettings::default(), 2_610_191_432, &blocked);
        let parsed = parse(&text);
        assert_eq!(parsed.blocked, blocked);
        assert_eq!(parsed.serial, Some(2_610_191_432));
        assert_eq!(parsed.skipped, 0);
    }

    #[test]
    fn test_parse_without_sentinel() {
        let parsed = parse("$TTL 60\nblocked\tIN\tA\t1.2.3.4\n");
        assert!(parsed.blocked.is_empty());
    }

    #[test]
    fn test_parse_skips_garbage_and_duplicates() {
        let text = ";HONEYPOT\n\
                    blocked\tIN\tA\t1.2.3.4\n\
                    blocked\tIN\tA\tnot-an-ip\n\
                    short\tline\n\
                    \n\
                    blocked\tIN\tA\t1.2.3.4\r\n\
                    blocked\tIN\tA\t5.6.7.8\n";
        let parsed = parse(text);
        assert_eq!(parsed.blocked, vec![v4(1, 2, 3, 4), v4(5, 6, 7, 8)]);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.serial, None);
    }

    #[test]
    fn test_parse_canonicalises_mapped_addresses() {
        let text = format!(
            "{}blocked\tIN\tAAAA\t::ffff:1.2.3.4\nblocked\tIN\tA\t1.2.3.4\n",
            render(&ZoneSettings::default(), 1, &[])
        );
        let parsed = parse(&text);
        assert_eq!(parsed.blocked, vec![v4(1, 2, 3, 4)]);
        assert_eq!(parsed.skipped, 0);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let parsed = load(Path::new("/tmp/nonexistent_i1_decoy_zone.db")).unwrap();
        assert_eq!(parsed, ParsedZone::default());
    }

    #[test]
    fn test_load_existing_file() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(
            tmpfile,
            "$TTL    60\n;HONEYPOT\nblocked\tIN\tA\t1.1.1.1\nblocked\tIN\tA\t8.8.8.8\n"
        )
        .unwrap();
        let parsed = load(tmpfile.path()).unwrap();
        assert_eq!(parsed.blocked, vec![v4(1, 1, 1, 1), v4(8, 8, 8, 8)]);
    }

    #[test]
    fn test_load_unreadable_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be read as a file.
        assert!(matches!(load(dir.path()), Err(DecoyError::Blocklist(_))));
    }
}
