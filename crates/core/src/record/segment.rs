//! Segment path templates. A `pathFormat` string mixes the literal token `%path` with
//! `strftime`-style time tokens; this module both renders one (recording
//! agent, on segment start) and inverts one (cleaner, on sweep).

use std::path::PathBuf;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use regex::Regex;

/// Render `path_format` for `path_name` at `when`, producing the full file
/// path for a new segment.
pub fn encode(path_format: &str, path_name: &str, when: DateTime<Local>) -> PathBuf {
    let substituted = path_format.replace("%path", path_name);
    let mut out = String::with_capacity(substituted.len() + 8);
    let mut chars = substituted.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", when.year())),
            Some('m') => out.push_str(&format!("{:02}", when.month())),
            Some('d') => out.push_str(&format!("{:02}", when.day())),
            Some('H') => out.push_str(&format!("{:02}", when.hour())),
            Some('M') => out.push_str(&format!("{:02}", when.minute())),
            Some('S') => out.push_str(&format!("{:02}", when.second())),
            Some('f') => out.push_str(&format!("{:06}", when.timestamp_subsec_micros())),
            Some('s') => out.push_str(&when.timestamp().to_string()),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    PathBuf::from(out)
}

/// The literal directory prefix of `path_format` up to (but not
/// including) the first `%` token — the cleaner's sweep root.
pub fn common_path(path_format: &str, path_name: &str) -> PathBuf {
    let substituted = path_format.replacen("%path", path_name, 1);
    let prefix = match substituted.find('%') {
        Some(idx) => &substituted[..idx],
        None => &substituted[..],
    };
    let prefix = match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    };
    PathBuf::from(prefix)
}

/// Invert `encode`: given a rendered path and the template that produced
/// it, recover the timestamp it was rendered at.
pub fn decode(path_format: &str, path_name: &str, candidate: &str) -> Option<DateTime<Local>> {
    let substituted = path_format.replace("%path", path_name);
    let mut pattern = String::from("^");
    let mut chars = substituted.chars().peekable();
    let mut order = Vec::new();
    while let Some(c) = chars.next() {
        if c != '%' {
            pattern.push_str(&regex::escape(&c.to_string()));
            continue;
        }
        match chars.next() {
            Some('Y') => {
                pattern.push_str("(?P<Y>\\d{4})");
                order.push('Y');
            }
            Some('m') => {
                pattern.push_str("(?P<m>\\d{2})");
                order.push('m');
            }
            Some('d') => {
                pattern.push_str("(?P<d>\\d{2})");
                order.push('d');
            }
            Some('H') => {
                pattern.push_str("(?P<H>\\d{2})");
                order.push('H');
            }
            Some('M') => {
                pattern.push_str("(?P<M>\\d{2})");
                order.push('M');
            }
            Some('S') => {
                pattern.push_str("(?P<S>\\d{2})");
                order.push('S');
            }
            Some('f') => {
                pattern.push_str("(?P<f>\\d{6})");
                order.push('f');
            }
            Some('s') => {
                pattern.push_str("(?P<s>\\d+)");
                order.push('s');
            }
            Some(other) => pattern.push_str(&regex::escape(&format!("%{other}"))),
            None => pattern.push('%'),
        }
    }
    pattern.push('$');
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(candidate)?;

    if let Some(secs) = caps.name("s") {
        let secs: i64 = secs.as_str().parse().ok()?;
        return Local.timestamp_opt(secs, 0).single();
    }

    let year: i32 = caps.name("Y")?.as_str().parse().ok()?;
    let month: u32 = caps.name("m")?.as_str().parse().ok()?;
    let day: u32 = caps.name("d")?.as_str().parse().ok()?;
    let hour: u32 = caps.name("H").map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    let minute: u32 = caps.name("M").map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    let second: u32 = caps.name("S").map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    let micros: u32 = caps.name("f").map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);

    Local
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()?
        .checked_add_signed(chrono::Duration::microseconds(micros as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let when = Local.with_ymd_and_hms(2009, 5, 20, 22, 15, 25).unwrap()
            + chrono::Duration::microseconds(427);
        let rendered = encode("%path/%Y-%m-%d_%H-%M-%S-%f.mp4", "cam1", when);
        let file_name = rendered.file_name().unwrap().to_str().unwrap();
        let decoded = decode("%Y-%m-%d_%H-%M-%S-%f.mp4", "cam1", file_name).unwrap();
        assert_eq!(decoded.timestamp_micros(), when.timestamp_micros());
    }

    #[test]
    fn decode_rejects_segment_outside_retention_window() {
        // Two candidate filenames, one inside the retention window and
        // one outside it.
        let older = decode("%Y-%m-%d_%H-%M-%S-%f.mp4", "cam1", "2008-05-20_22-15-25-000125.mp4")
            .unwrap();
        let newer = decode("%Y-%m-%d_%H-%M-%S-%f.mp4", "cam1", "2009-05-20_22-15-25-000427.mp4")
            .unwrap();
        let now = Local.with_ymd_and_hms(2009, 5, 20, 22, 15, 25).unwrap()
            + chrono::Duration::microseconds(427);
        let delete_after = chrono::Duration::seconds(10);
        assert!(now.signed_duration_since(older) > delete_after);
        assert!(now.signed_duration_since(newer) <= delete_after);
    }

    #[test]
    fn common_path_stops_at_first_token() {
        let p = common_path("%path/recordings/%Y/%m/%d.mp4", "cam1");
        assert_eq!(p, PathBuf::from("cam1/recordings"));
    }
}
