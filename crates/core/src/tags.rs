use chrono::{FixedOffset, NaiveDateTime, Timelike};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Capture or edit time as stored in metadata.
///
/// Keeps the number of fractional digits the source carried, so formatting a
/// parsed value reproduces it exactly and precision is never silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    local: NaiveDateTime,
    offset: Option<FixedOffset>,
    subsec_digits: u8,
}

impl Timestamp {
    pub fn new(local: NaiveDateTime, offset: Option<FixedOffset>, subsec_digits: u8) -> Self {
        let subsec_digits = subsec_digits.min(9);
        let stamp = Self {
            local,
            offset,
            subsec_digits: 9,
        };
        stamp.truncated(subsec_digits)
    }

    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.len() < 19 || !input.is_char_boundary(19) {
            return None;
        }
        let (head, rest) = input.split_at(19);
        let local = parse_head(head)?;

        let (fraction, rest) = match rest.strip_prefix('.') {
            Some(after) => {
                let end = after
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(after.len());
                if end == 0 || end > 9 {
                    return None;
                }
                (&after[..end], &after[end..])
            }
            None => ("", rest),
        };

        let offset = parse_offset(rest)?;
        let stamp = Self {
            local,
            offset,
            subsec_digits: 0,
        };
        if fraction.is_empty() {
            Some(stamp)
        } else {
            stamp.with_fraction(fraction)
        }
    }

    pub fn local(&self) -> NaiveDateTime {
        self.local
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        self.offset
    }

    pub fn subsec_digits(&self) -> u8 {
        self.subsec_digits
    }

    pub fn millis(&self) -> u32 {
        self.local.nanosecond() / 1_000_000
    }

    /// Replaces the fractional seconds with `digits` (e.g. `"050"` from
    /// `SubSecTimeOriginal`).
    pub fn with_fraction(self, digits: &str) -> Option<Self> {
        let digits = digits.trim();
        if digits.is_empty() || digits.len() > 9 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let nanos = format!("{:0<9}", digits).parse::<u32>().ok()?;
        Some(Self {
            local: self.local.with_nanosecond(nanos)?,
            offset: self.offset,
            subsec_digits: digits.len() as u8,
        })
    }

    pub fn with_offset(self, offset: Option<FixedOffset>) -> Self {
        Self { offset, ..self }
    }

    /// Time used for naming: UTC when an offset is known and `utc` is set,
    /// wall-clock time otherwise.
    pub fn naming_time(&self, utc: bool) -> NaiveDateTime {
        match (utc, self.offset) {
            (true, Some(offset)) => self.local - offset,
            _ => self.local,
        }
    }

    /// Whether `self` carries strictly more sub-second precision than
    /// `coarser` and agrees with it everywhere `coarser` is defined.
    pub fn refines(&self, coarser: &Timestamp) -> bool {
        self.subsec_digits > coarser.subsec_digits
            && (coarser.offset.is_none() || coarser.offset == self.offset)
            && self.truncated(coarser.subsec_digits).local == coarser.local
    }

    fn truncated(&self, digits: u8) -> Self {
        let digits = digits.min(self.subsec_digits);
        let step = 10u32.pow(9 - u32::from(digits));
        let nanos = self.local.nanosecond() % 1_000_000_000 / step * step;
        Self {
            local: self.local.with_nanosecond(nanos).unwrap_or(self.local),
            offset: self.offset,
            subsec_digits: digits,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local.format("%Y:%m:%d %H:%M:%S"))?;
        if self.subsec_digits > 0 {
            let nanos = format!("{:09}", self.local.nanosecond() % 1_000_000_000);
            write!(f, ".{}", &nanos[..usize::from(self.subsec_digits)])?;
        }
        if let Some(offset) = self.offset {
            write!(f, "{offset}")?;
        }
        Ok(())
    }
}

fn parse_head(head: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &[
        "%Y:%m:%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y:%m:%dT%H:%M:%S",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(head, fmt).ok())
}

pub(crate) fn parse_offset(input: &str) -> Option<Option<FixedOffset>> {
    let input = input.trim();
    if input.is_empty() {
        return Some(None);
    }
    if input.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).map(Some);
    }

    let sign = match input.as_bytes()[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits: String = input[1..].chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).map(Some)
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Text(String),
    Number(f64),
    Timestamp(Timestamp),
    List(Vec<String>),
}

impl TagValue {
    pub fn as_timestamp(&self) -> Option<&Timestamp> {
        match self {
            TagValue::Timestamp(stamp) => Some(stamp),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            TagValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Values as passed to a `-TAG=VALUE` assignment. Lists produce one
    /// assignment per item.
    pub fn assignments(&self) -> Vec<String> {
        match self {
            TagValue::List(items) => items.clone(),
            other => vec![other.to_string()],
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            TagValue::Text(text) => Value::String(text.clone()),
            TagValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(n.to_string())),
            TagValue::Timestamp(stamp) => Value::String(stamp.to_string()),
            TagValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Text(text) => f.write_str(text),
            TagValue::Number(n) => write!(f, "{n}"),
            TagValue::Timestamp(stamp) => write!(f, "{stamp}"),
            TagValue::List(items) => f.write_str(&items.join(", ")),
        }
    }
}

/// Tag name to value, iterated in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagSet {
    tags: BTreeMap<String, TagValue>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&TagValue> {
        self.tags.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: TagValue) -> Option<TagValue> {
        self.tags.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<TagValue> {
        self.tags.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.tags.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn timestamp(&self, name: &str) -> Option<&Timestamp> {
        self.get(name).and_then(TagValue::as_timestamp)
    }

    /// Trimmed, non-empty text value.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(TagValue::as_text)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn capture_time(&self) -> Option<&Timestamp> {
        self.timestamp("DateTimeOriginal")
            .or_else(|| self.timestamp("CreateDate"))
    }

    pub fn merge_missing_from(&mut self, fallback: &TagSet) {
        for (name, value) in &fallback.tags {
            if !self.tags.contains_key(name) {
                self.tags.insert(name.clone(), value.clone());
            }
        }
    }
}

impl FromIterator<(String, TagValue)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, TagValue)>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = (&'a String, &'a TagValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, TagValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, NaiveDate};

    fn stamp(input: &str) -> Timestamp {
        Timestamp::parse(input).expect("timestamp must parse")
    }

    #[test]
    fn parse_keeps_fraction_digits_and_offset() {
        let t = stamp("2024:01:01 12:30:01.050+02:00");
        assert_eq!(t.subsec_digits(), 3);
        assert_eq!(t.millis(), 50);
        assert_eq!(t.offset(), FixedOffset::east_opt(7200));
        assert_eq!(t.to_string(), "2024:01:01 12:30:01.050+02:00");
    }

    #[test]
    fn parse_accepts_iso_separators_and_zulu() {
        let t = stamp("2026-02-08T10:20:30.5Z");
        assert_eq!(t.local().year(), 2026);
        assert_eq!(t.subsec_digits(), 1);
        assert_eq!(t.to_string(), "2026:02:08 10:20:30.5+00:00");
    }

    #[test]
    fn parse_rejects_placeholders_and_bad_fractions() {
        assert!(Timestamp::parse("0000:00:00 00:00:00").is_none());
        assert!(Timestamp::parse("2024:01:01 12:30:01.").is_none());
        assert!(Timestamp::parse("2024:01:01 12:30:01.1234567890").is_none());
        assert!(Timestamp::parse("2024:01:01 12:30:01 junk").is_none());
    }

    #[test]
    fn short_fraction_is_not_padded_on_output() {
        let t = stamp("2024:01:01 12:30:01.05");
        assert_eq!(t.to_string(), "2024:01:01 12:30:01.05");
        assert_ne!(t, stamp("2024:01:01 12:30:01.050"));
    }

    #[test]
    fn refines_requires_more_digits_and_agreement() {
        let coarse = stamp("2024:01:01 12:30:01");
        let fine = stamp("2024:01:01 12:30:01.123");
        assert!(fine.refines(&coarse));
        assert!(!coarse.refines(&fine));
        assert!(!stamp("2024:01:01 12:30:02.123").refines(&coarse));
        assert!(stamp("2024:01:01 12:30:01.123+01:00").refines(&coarse));
        assert!(!fine.refines(&stamp("2024:01:01 12:30:01+01:00")));
    }

    #[test]
    fn naming_time_converts_to_utc_only_with_offset() {
        let t = stamp("2024:01:01 01:00:00+02:00");
        let expected = NaiveDate::from_ymd_opt(2023, 12, 31)
            .and_then(|d| d.and_hms_opt(23, 0, 0))
            .expect("valid date");
        assert_eq!(t.naming_time(true), expected);
        assert_eq!(t.naming_time(false), t.local());
        let naive = stamp("2024:01:01 01:00:00");
        assert_eq!(naive.naming_time(true), naive.local());
    }

    #[test]
    fn merge_missing_from_only_fills_missing_tags() {
        let mut base: TagSet = [
            ("Artist".to_string(), TagValue::Text("Alice".to_string())),
            ("Rating".to_string(), TagValue::Number(3.0)),
        ]
        .into_iter()
        .collect();
        let fallback: TagSet = [
            ("Artist".to_string(), TagValue::Text("Bob".to_string())),
            ("Make".to_string(), TagValue::Text("Canon".to_string())),
        ]
        .into_iter()
        .collect();

        base.merge_missing_from(&fallback);
        assert_eq!(base.text("Artist"), Some("Alice"));
        assert_eq!(base.text("Make"), Some("Canon"));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn capture_time_falls_back_to_create_date() {
        let mut tags = TagSet::new();
        tags.insert(
            "CreateDate",
            TagValue::Timestamp(stamp("2020:05:05 05:05:05")),
        );
        assert_eq!(
            tags.capture_time().map(ToString::to_string).as_deref(),
            Some("2020:05:05 05:05:05")
        );
        tags.insert(
            "DateTimeOriginal",
            TagValue::Timestamp(stamp("2020:05:05 05:05:04")),
        );
        assert_eq!(
            tags.capture_time().map(ToString::to_string).as_deref(),
            Some("2020:05:05 05:05:04")
        );
    }

    #[test]
    fn list_values_expand_to_one_assignment_each() {
        let value = TagValue::List(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(value.assignments(), vec!["a", "b"]);
        assert_eq!(TagValue::Number(37.5).assignments(), vec!["37.5"]);
    }
}
