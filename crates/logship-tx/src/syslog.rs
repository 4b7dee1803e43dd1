//! A small RFC3164-style syslog line parser
//!
//! Produces a flat key/value map: `host`, `program`, `pid`, `message`,
//! `priority`, `facility`, and `_epoch` when the timestamp parses. No
//! syslog crate is involved; the classic BSD format is one regex wide.

use std::sync::LazyLock;

use chrono::{Datelike, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use serde_json::{json, Map, Value};

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^ (?: < (?P<pri> \d{1,3} ) > )?
        (?P<ts> [A-Z][a-z]{2} \s+ \d{1,2} \s+ \d{2}:\d{2}:\d{2} ) \s+
        (?P<host> \S+ ) \s+
        (?P<prog> [^\s:\[]+ ) (?: \[ (?P<pid> \d+ ) \] )? : \s*
        (?P<msg> .* ) $",
    )
    .expect("syslog grammar")
});

/// Parse one syslog line into a flat map; `None` when the line doesn't
/// look like syslog at all.
pub fn parse(line: &str) -> Option<Map<String, Value>> {
    let caps = LINE_RE.captures(line)?;
    let mut out = Map::new();

    out.insert("host".into(), json!(&caps["host"]));
    out.insert("program".into(), json!(&caps["prog"]));
    if let Some(pid) = caps.name("pid").and_then(|m| m.as_str().parse::<i64>().ok()) {
        out.insert("pid".into(), json!(pid));
    }
    out.insert("message".into(), json!(&caps["msg"]));

    if let Some(pri) = caps.name("pri").and_then(|m| m.as_str().parse::<u16>().ok()) {
        out.insert("priority".into(), json!(pri & 0x07));
        out.insert("facility".into(), json!(pri >> 3));
    }

    // Event time drives index expansion downstream.
    if let Some(epoch) = parse_timestamp(&caps["ts"]) {
        out.insert("_epoch".into(), json!(epoch));
    }

    Some(out)
}

/// BSD syslog timestamps carry no year; assume the current one.
fn parse_timestamp(ts: &str) -> Option<i64> {
    let mut tokens = ts.split_whitespace();
    let (month, day, time) = (tokens.next()?, tokens.next()?, tokens.next()?);
    let stamped = format!("{} {} {:0>2} {}", Local::now().year(), month, day, time);
    let naive = NaiveDateTime::parse_from_str(&stamped, "%Y %b %d %H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
}
