use crate::sanitize::sanitize_segment;
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_TEMPLATE: &str = "{year}/{month}/{yy}{month}{day}_{hour}{minute}{second}{millis}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Literal(String),
    Token(Token),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Year,
    ShortYear,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Millis,
    Subsec,
    Make,
    Model,
    OrigName,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template is empty")]
    Empty,
    #[error("unbalanced braces")]
    UnbalancedBraces,
    #[error("unknown token: {0}")]
    UnknownToken(String),
    #[error("template has an empty path segment")]
    EmptySegment,
    #[error("template segment \"{0}\" points outside the catalog")]
    RelativeSegment(String),
}

/// Values a template is rendered from.
#[derive(Debug, Clone)]
pub struct NamingContext<'a> {
    pub time: NaiveDateTime,
    pub subsec_digits: u8,
    pub make: Option<&'a str>,
    pub model: Option<&'a str>,
    pub orig_name: &'a str,
}

/// Parsed naming template. `/` separates directory segments; the last
/// segment is the file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Vec<TemplatePart>>,
}

impl Template {
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TemplateError::Empty);
        }
        let segments = input
            .split('/')
            .map(parse_segment)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: input.to_string(),
            segments,
        })
    }

    /// Renders the relative stem, e.g. `2024/01/240101_123001050`.
    pub fn render(&self, ctx: &NamingContext<'_>) -> String {
        self.segments
            .iter()
            .map(|parts| sanitize_segment(&render_parts(parts, ctx)))
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl Default for Template {
    fn default() -> Self {
        Self {
            source: DEFAULT_TEMPLATE.to_string(),
            segments: DEFAULT_TEMPLATE
                .split('/')
                .filter_map(|segment| parse_segment(segment).ok())
                .collect(),
        }
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

pub fn validate_template(input: &str) -> Result<(), TemplateError> {
    Template::parse(input).map(|_| ())
}

fn parse_segment(input: &str) -> Result<Vec<TemplatePart>, TemplateError> {
    if input.is_empty() {
        return Err(TemplateError::EmptySegment);
    }
    if input == "." || input == ".." {
        return Err(TemplateError::RelativeSegment(input.to_string()));
    }

    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                let mut token = String::new();
                let mut found_close = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        found_close = true;
                        break;
                    }
                    if next == '{' {
                        return Err(TemplateError::UnbalancedBraces);
                    }
                    token.push(next);
                }
                if !found_close || token.is_empty() {
                    return Err(TemplateError::UnbalancedBraces);
                }
                parts.push(TemplatePart::Token(parse_token(&token)?));
            }
            '}' => return Err(TemplateError::UnbalancedBraces),
            _ => literal.push(ch),
        }
    }

    if !literal.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    Ok(parts)
}

fn parse_token(token: &str) -> Result<Token, TemplateError> {
    match token {
        "year" => Ok(Token::Year),
        "yy" => Ok(Token::ShortYear),
        "month" => Ok(Token::Month),
        "day" => Ok(Token::Day),
        "hour" => Ok(Token::Hour),
        "minute" => Ok(Token::Minute),
        "second" => Ok(Token::Second),
        "millis" => Ok(Token::Millis),
        "subsec" => Ok(Token::Subsec),
        "make" => Ok(Token::Make),
        "model" => Ok(Token::Model),
        "orig_name" => Ok(Token::OrigName),
        other => Err(TemplateError::UnknownToken(other.to_string())),
    }
}

fn render_parts(parts: &[TemplatePart], ctx: &NamingContext<'_>) -> String {
    let t = ctx.time;
    let mut output = String::new();
    for part in parts {
        match part {
            TemplatePart::Literal(s) => output.push_str(s),
            TemplatePart::Token(token) => {
                let value = match token {
                    Token::Year => format!("{:04}", t.year()),
                    Token::ShortYear => format!("{:02}", t.year().rem_euclid(100)),
                    Token::Month => format!("{:02}", t.month()),
                    Token::Day => format!("{:02}", t.day()),
                    Token::Hour => format!("{:02}", t.hour()),
                    Token::Minute => format!("{:02}", t.minute()),
                    Token::Second => format!("{:02}", t.second()),
                    Token::Millis => format!("{:03}", t.nanosecond() % 1_000_000_000 / 1_000_000),
                    Token::Subsec => {
                        let nanos = format!("{:09}", t.nanosecond() % 1_000_000_000);
                        nanos[..usize::from(ctx.subsec_digits.min(9))].to_string()
                    }
                    Token::Make => ctx.make.unwrap_or_default().trim().to_string(),
                    Token::Model => ctx.model.unwrap_or_default().trim().to_string(),
                    Token::OrigName => ctx.orig_name.to_string(),
                };
                output.push_str(&normalize_token_value(&value));
            }
        }
    }
    output
}

fn normalize_token_value(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join("-")
}
