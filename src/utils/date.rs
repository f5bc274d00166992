//! Publication-date normalization and the calendar arithmetic used for search windows.

use std::sync::OnceLock;

use regex::Regex;
use time::macros::format_description;
use time::{Date, Duration};
use tracing::{debug, warn};

/// Fallback for dates that cannot be recovered; keeps age computations defined.
pub const SENTINEL_PUBDATE: &str = "1900 Jan 1";
pub const SENTINEL_ISO: &str = "1900-01-01";

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*([1-3][0-9]{3})").expect("valid regex"))
}

fn year_in(value: &str) -> Option<&str> {
    year_re()
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn season_month(value: &str) -> Option<&'static str> {
    let lower = value.to_ascii_lowercase();
    if lower.contains("spring") {
        Some("Mar")
    } else if lower.contains("summer") {
        Some("Jun")
    } else if lower.contains("fall") {
        Some("Sep")
    } else if lower.contains("winter") {
        Some("Dec")
    } else {
        None
    }
}

fn month_in(value: &str) -> Option<&'static str> {
    let lower = value.to_ascii_lowercase();
    // "mai" covers German-language metadata.
    const NEEDLES: [(&str, &str); 13] = [
        ("jan", "Jan"),
        ("feb", "Feb"),
        ("mar", "Mar"),
        ("apr", "Apr"),
        ("mai", "May"),
        ("may", "May"),
        ("jun", "Jun"),
        ("jul", "Jul"),
        ("aug", "Aug"),
        ("sep", "Sep"),
        ("oct", "Oct"),
        ("nov", "Nov"),
        ("dec", "Dec"),
    ];
    NEEDLES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, abbr)| *abbr)
}

/// Bring a free-text publication date into `YYYY Mon D` form.
///
/// Seasons map to the first month of the season, a missing day becomes 1, a missing
/// month becomes January, and a month range such as `2021 Jan-Mar 1` keeps its first
/// endpoint. Anything without a recoverable year collapses to [`SENTINEL_PUBDATE`].
pub fn normalize_pubdate(raw: &str) -> String {
    let mut value = raw.trim().to_string();
    if value.is_empty() || value == "NA" {
        value = SENTINEL_PUBDATE.to_string();
    }

    if let Some(month) = season_month(&value) {
        let Some(year) = year_in(&value) else {
            return SENTINEL_PUBDATE.to_string();
        };
        value = format!("{year} {month} 1");
    }

    let tokens = value.split_whitespace().count();
    if tokens < 3 {
        let Some(year) = year_in(&value).map(str::to_string) else {
            return SENTINEL_PUBDATE.to_string();
        };
        value = if tokens == 2 {
            let month = month_in(&value)
                .or_else(|| season_month(&value))
                .unwrap_or("Jan");
            format!("{year} {month} 1")
        } else {
            format!("{year} Jan 1")
        };
    }

    let mut parts = value.split(['-', '/']);
    let first = parts.next().unwrap_or_default();
    match parts.next() {
        Some(second) => {
            let tail: String = second.chars().skip(3).collect();
            format!("{first}{tail}")
        }
        None => value,
    }
}

/// Strict parse of `YYYY Mon D`; runs of whitespace count as one separator.
pub fn parse_pubdate(value: &str) -> Option<Date> {
    let compact = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let format = format_description!(
        "[year] [month repr:short case_sensitive:false] [day padding:none]"
    );
    Date::parse(&compact, format).ok()
}

pub fn to_iso(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub fn parse_iso(value: &str) -> Option<Date> {
    let format = format_description!("[year]-[month padding:none]-[day padding:none]");
    Date::parse(value.trim(), format).ok()
}

/// Search windows use `YYYY/MM/DD`.
pub fn parse_slash(value: &str) -> Option<Date> {
    let format = format_description!("[year]/[month padding:none]/[day padding:none]");
    Date::parse(value.trim(), format).ok()
}

pub fn format_slash(date: Date) -> String {
    format!(
        "{:04}/{:02}/{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// `2019/03/01 00:00` → `2019-03-01`.
pub fn sortdate_to_iso(sortdate: &str) -> Option<String> {
    let day_part = sortdate.split_whitespace().next()?;
    parse_slash(day_part).map(to_iso)
}

/// Midpoint of a window in whole days, rounded towards `start`.
pub fn midpoint(start: Date, end: Date) -> Date {
    let days = (end - start).whole_days();
    start + Duration::days(days.div_euclid(2))
}

pub fn next_day(date: Date) -> Date {
    date.next_day().unwrap_or(date)
}

pub fn today_utc() -> Date {
    time::OffsetDateTime::now_utc().date()
}

/// Pick the publication date of an article: epub date, then the normalized print date,
/// then the sort date, then the sentinel. Every fallback is logged.
pub fn resolve_publication_date(pmid: &str, epubdate: &str, pubdate: &str, sortdate: &str) -> String {
    let epubdate = epubdate.trim();
    if !epubdate.is_empty() {
        if let Some(date) = parse_pubdate(&normalize_pubdate(epubdate)) {
            return to_iso(date);
        }
        debug!(pmid, epubdate, "epub date not parseable, trying pubdate");
    }

    let normalized = normalize_pubdate(pubdate);
    if let Some(date) = parse_pubdate(&normalized) {
        if pubdate.trim().is_empty() {
            debug!(pmid, "no pubdate, using sentinel date");
        }
        return to_iso(date);
    }

    warn!(pmid, pubdate, normalized = %normalized, "pubdate not parseable, using sort date");
    if let Some(iso) = sortdate_to_iso(sortdate) {
        return iso;
    }
    warn!(pmid, sortdate, "sort date not parseable, using sentinel date");
    SENTINEL_ISO.to_string()
}
