//! Stateless parsers mapping raw log lines to normalized events.
//!
//! Supported formats: `apache_combined`, `syslog` (BSD-style), `json`,
//! and `auto` (json, then apache_combined, then syslog).

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::models::Event;

pub const FORMAT_APACHE_COMBINED: &str = "apache_combined";
pub const FORMAT_SYSLOG: &str = "syslog";
pub const FORMAT_JSON: &str = "json";
pub const FORMAT_AUTO: &str = "auto";

static APACHE_COMBINED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<remote_host>[\w\-.:\[\]]+)\s+(?P<ident>\S+)\s+(?P<user>\S+)\s+\[(?P<time>[^\]]+)\]\s+"(?P<request>[^"]*?)"\s+(?P<status>\d+)\s+(?P<size>\d+|-)(?:\s+"(?P<referrer>[^"]*?)"\s+"(?P<user_agent>[^"]*?)")?$"#,
    )
    .unwrap()
});

static SYSLOG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<month>\w{3})\s+(?P<day>\d{1,2})\s+(?P<time>\d{2}:\d{2}:\d{2})\s+(?P<host>[\w\-.]+)\s+(?P<program>[\w\-/.]+)(?:\[(?P<pid>\d+)\])?:\s+(?P<message>.*)$",
    )
    .unwrap()
});

/// Parse a raw line in the named format into an event with
/// `event_type = "log"`. `format = None` or `"auto"` tries json,
/// apache_combined, then syslog, first success wins.
pub fn parse_line(source: &str, line: &str, format: Option<&str>) -> Result<Event> {
    match format.unwrap_or(FORMAT_AUTO) {
        FORMAT_APACHE_COMBINED => parse_apache_combined(source, line),
        FORMAT_SYSLOG => parse_syslog(source, line, Utc::now()),
        FORMAT_JSON => parse_json(source, line),
        FORMAT_AUTO => parse_json(source, line)
            .or_else(|_| parse_apache_combined(source, line))
            .or_else(|_| parse_syslog(source, line, Utc::now()))
            .map_err(|_| PipelineError::parsing("could not parse log line in any known format")),
        other => Err(PipelineError::parsing(format!("unknown format: {}", other))),
    }
}

fn build_event(source: &str, timestamp: DateTime<Utc>, data: Map<String, Value>) -> Event {
    Event {
        id: None,
        source: source.to_string(),
        event_type: "log".to_string(),
        timestamp: Some(timestamp),
        vendor: None,
        severity: "info".to_string(),
        data,
        enriched: Map::new(),
    }
}

/// Apache combined / common log format. The bracketed time keeps its
/// original offset through parsing; the stored instant is exact.
pub fn parse_apache_combined(source: &str, line: &str) -> Result<Event> {
    let caps = APACHE_COMBINED_RE
        .captures(line)
        .ok_or_else(|| PipelineError::parsing("line does not match apache_combined format"))?;

    let time_str = caps.name("time").unwrap().as_str();
    let timestamp = DateTime::parse_from_str(time_str, "%d/%b/%Y:%H:%M:%S %z")
        .map_err(|e| PipelineError::parsing(format!("bad apache timestamp '{}': {}", time_str, e)))?;

    let mut data = Map::new();
    data.insert(
        "remote_host".into(),
        Value::from(caps.name("remote_host").unwrap().as_str()),
    );
    data.insert("ident".into(), Value::from(caps.name("ident").unwrap().as_str()));
    data.insert("user".into(), Value::from(caps.name("user").unwrap().as_str()));
    data.insert(
        "request".into(),
        Value::from(caps.name("request").unwrap().as_str()),
    );
    data.insert(
        "status".into(),
        Value::from(
            caps.name("status")
                .unwrap()
                .as_str()
                .parse::<i64>()
                .map_err(|e| PipelineError::parsing(format!("bad status: {}", e)))?,
        ),
    );
    let size = caps.name("size").unwrap().as_str();
    data.insert(
        "size".into(),
        if size == "-" {
            Value::from(0)
        } else {
            Value::from(
                size.parse::<i64>()
                    .map_err(|e| PipelineError::parsing(format!("bad size: {}", e)))?,
            )
        },
    );
    if let Some(referrer) = caps.name("referrer") {
        data.insert("referrer".into(), Value::from(referrer.as_str()));
    }
    if let Some(user_agent) = caps.name("user_agent") {
        data.insert("user_agent".into(), Value::from(user_agent.as_str()));
    }

    Ok(build_event(source, timestamp.with_timezone(&Utc), data))
}

/// BSD syslog: `MMM d HH:mm:ss host program[pid]: message`. The format
/// carries no year, so one is injected relative to `now`: the current
/// year when the parsed month is not in the future, otherwise the
/// previous year (a December line read in January belongs to last year).
pub fn parse_syslog(source: &str, line: &str, now: DateTime<Utc>) -> Result<Event> {
    let caps = SYSLOG_RE
        .captures(line)
        .ok_or_else(|| PipelineError::parsing("line does not match syslog format"))?;

    let month = match caps.name("month").unwrap().as_str() {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        other => return Err(PipelineError::parsing(format!("bad month: {}", other))),
    };
    let year = if month <= now.month() {
        now.year()
    } else {
        now.year() - 1
    };

    let day: u32 = caps
        .name("day")
        .unwrap()
        .as_str()
        .parse()
        .map_err(|e| PipelineError::parsing(format!("bad day: {}", e)))?;
    let time = caps.name("time").unwrap().as_str();
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| PipelineError::parsing("invalid syslog date"))?;
    let naive = date
        .and_time(
            chrono::NaiveTime::parse_from_str(time, "%H:%M:%S")
                .map_err(|e| PipelineError::parsing(format!("bad time: {}", e)))?,
        );
    let timestamp = Utc.from_utc_datetime(&naive);

    let mut data = Map::new();
    data.insert("host".into(), Value::from(caps.name("host").unwrap().as_str()));
    data.insert(
        "program".into(),
        Value::from(caps.name("program").unwrap().as_str()),
    );
    if let Some(pid) = caps.name("pid") {
        data.insert(
            "pid".into(),
            Value::from(
                pid.as_str()
                    .parse::<i64>()
                    .map_err(|e| PipelineError::parsing(format!("bad pid: {}", e)))?,
            ),
        );
    }
    data.insert(
        "message".into(),
        Value::from(caps.name("message").unwrap().as_str()),
    );

    Ok(build_event(source, timestamp, data))
}

/// JSON lines: the object becomes `data`. A `timestamp` (or common
/// alias) field is lifted out; absent one, the wall clock is used.
/// `level` / `severity` values are lowercased.
pub fn parse_json(source: &str, line: &str) -> Result<Event> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| PipelineError::parsing(format!("invalid json: {}", e)))?;
    let mut data = match value {
        Value::Object(map) => map,
        _ => return Err(PipelineError::parsing("json log line must be an object")),
    };

    let mut timestamp = None;
    for key in ["timestamp", "@timestamp", "time", "datetime"] {
        if let Some(raw) = data.remove(key) {
            let parsed = raw
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            match parsed {
                Some(dt) => {
                    timestamp = Some(dt);
                    break;
                }
                // Unparseable value: keep it in data rather than drop it.
                None => {
                    data.insert(key.to_string(), raw);
                }
            }
        }
    }

    for key in ["level", "severity"] {
        if let Some(Value::String(s)) = data.get(key) {
            let lowered = s.to_lowercase();
            data.insert(key.to_string(), Value::from(lowered));
        }
    }

    Ok(build_event(
        source,
        timestamp.unwrap_or_else(Utc::now),
        data,
    ))
}

/// Detect the format of a line without committing to a parse.
pub fn detect_format(line: &str) -> Option<&'static str> {
    if serde_json::from_str::<Value>(line)
        .map(|v| v.is_object())
        .unwrap_or(false)
    {
        return Some(FORMAT_JSON);
    }
    if APACHE_COMBINED_RE.is_match(line) {
        return Some(FORMAT_APACHE_COMBINED);
    }
    if SYSLOG_RE.is_match(line) {
        return Some(FORMAT_SYSLOG);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const APACHE_LINE: &str = r#"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] "GET /apache_pb.gif HTTP/1.0" 200 2326 "http://www.example.com/start.html" "Mozilla/4.08 [en] (Win98; I ;Nav)""#;
    const SYSLOG_LINE: &str = "Feb  5 12:23:09 myhost program[123]: Sample log message";
    const JSON_LINE: &str =
        r#"{"timestamp": "2024-02-05T14:11:05Z", "level": "WARN", "message": "disk almost full"}"#;

    #[test]
    fn apache_combined_fields_and_offset() {
        let event = parse_apache_combined("apache", APACHE_LINE).unwrap();
        assert_eq!(event.data["remote_host"], "127.0.0.1");
        assert_eq!(event.data["user"], "frank");
        assert_eq!(event.data["status"], 200);
        assert_eq!(event.data["size"], 2326);
        // 13:55:36 -0700 is 20:55:36 UTC
        let ts = event.timestamp.unwrap();
        assert_eq!(ts.hour(), 20);
        assert_eq!((ts.year(), ts.month(), ts.day()), (2000, 10, 10));
    }

    #[test]
    fn apache_combined_without_referrer_block() {
        let line = r#"10.0.0.5 - - [10/Oct/2000:13:55:36 +0000] "POST /login HTTP/1.1" 401 12"#;
        let event = parse_apache_combined("apache", line).unwrap();
        assert_eq!(event.data["status"], 401);
        assert!(event.data.get("referrer").is_none());
    }

    #[test]
    fn syslog_injects_current_year() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let event = parse_syslog("syslog", SYSLOG_LINE, now).unwrap();
        let ts = event.timestamp.unwrap();
        assert_eq!(ts.year(), 2024);
        assert_eq!(event.data["host"], "myhost");
        assert_eq!(event.data["program"], "program");
        assert_eq!(event.data["pid"], 123);
        assert_eq!(event.data["message"], "Sample log message");
    }

    #[test]
    fn syslog_year_rollover_uses_previous_year() {
        // A December line processed on Jan 1 belongs to the previous year.
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 30, 0).unwrap();
        let event =
            parse_syslog("syslog", "Dec 31 23:59:59 host prog[1]: last", now).unwrap();
        assert_eq!(event.timestamp.unwrap().year(), 2024);
    }

    #[test]
    fn json_lifts_timestamp_and_lowercases_level() {
        let event = parse_json("app", JSON_LINE).unwrap();
        assert_eq!(event.timestamp.unwrap().hour(), 14);
        assert_eq!(event.data["level"], "warn");
        assert!(event.data.get("timestamp").is_none());
    }

    #[test]
    fn json_without_timestamp_uses_wall_clock() {
        let event = parse_json("app", r#"{"message": "hi"}"#).unwrap();
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn auto_detection_order() {
        assert_eq!(detect_format(JSON_LINE), Some(FORMAT_JSON));
        assert_eq!(detect_format(APACHE_LINE), Some(FORMAT_APACHE_COMBINED));
        assert_eq!(detect_format(SYSLOG_LINE), Some(FORMAT_SYSLOG));
        assert_eq!(detect_format("not a log line"), None);
    }

    #[test]
    fn auto_parse_failure_is_reported() {
        let err = parse_line("x", "???", None).unwrap_err();
        assert!(err.to_string().contains("could not parse"));
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(parse_line("x", JSON_LINE, Some("cef")).is_err());
    }
}
