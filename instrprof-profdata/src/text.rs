//! Text profiles, the human readable dump format.
//!
//! A text profile starts with optional header lines that set the variant flags, followed by one
//! block per function:
//!
//! ```text
//! :ir
//! main
//! # Func Hash:
//! 0x1234
//! # Num Counters:
//! 2
//! # Counter Values:
//! 10
//! 3
//! ```
//!
//! Blank lines and lines starting with `#` are ignored everywhere. A block may be followed by a
//! `:value_profile` marker and the value profiling data of the function.

use std::fmt::Write;
use std::iter::Peekable;

use instrprof_common::{Error, ErrorKind, ReadOptions};

use crate::compat::ProfileFormat;
use crate::record::{FunctionRecord, InstrProfile, ProfileKind, ValueData, ValueKind, ValueProfile};

const VALUE_PROFILE_MARKER: &str = ":value_profile";

/// Returns `true` if the buffer looks like a text profile.
///
/// Only the first few bytes are inspected, they must be printable ASCII or whitespace.
pub fn is_text(data: &[u8]) -> bool {
    data.iter()
        .take(64)
        .all(|&b| b.is_ascii_graphic() || b.is_ascii_whitespace())
}

/// A significant line of the input and its 1-based line number.
type Line<'a> = (usize, &'a str);

struct Lines<'a> {
    inner: Peekable<Box<dyn Iterator<Item = Line<'a>> + 'a>>,
    last_line: usize,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        let significant: Box<dyn Iterator<Item = Line<'a>> + 'a> = Box::new(
            text.lines()
                .enumerate()
                .map(|(index, line)| (index + 1, line.trim()))
                .filter(|(_, line)| !line.is_empty() && !line.starts_with('#')),
        );

        Self {
            inner: significant.peekable(),
            last_line: 0,
        }
    }

    fn peek(&mut self) -> Option<Line<'a>> {
        self.inner.peek().copied()
    }

    fn next(&mut self) -> Option<Line<'a>> {
        let line = self.inner.next()?;
        self.last_line = line.0;
        Some(line)
    }

    /// Returns the next line or fails with `MalformedLine` at the end of input.
    fn expect(&mut self, what: &str) -> Result<Line<'a>, Error> {
        self.next().ok_or_else(|| {
            Error::new(ErrorKind::MalformedLine)
                .at_line(self.last_line + 1)
                .with_detail(format!("expected {what}, found end of input"))
        })
    }

    fn expect_int(&mut self, what: &str) -> Result<u64, Error> {
        let (line_no, line) = self.expect(what)?;
        parse_int(line).ok_or_else(|| malformed(line_no, what, line))
    }
}

fn malformed(line_no: usize, what: &str, line: &str) -> Error {
    Error::new(ErrorKind::MalformedLine)
        .at_line(line_no)
        .with_detail(format!("expected {what}, found `{line}`"))
}

/// Parses a decimal or `0x` prefixed hexadecimal integer.
fn parse_int(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Reads the header lines and returns the variant flags they set.
fn parse_header(lines: &mut Lines<'_>) -> Result<ProfileKind, Error> {
    let mut kind = ProfileKind::default();

    while let Some((line_no, line)) = lines.peek() {
        let Some(flag) = line.strip_prefix(':') else {
            break;
        };
        if line == VALUE_PROFILE_MARKER {
            return Err(malformed(line_no, "a function name", line));
        }

        match flag.to_ascii_lowercase().as_str() {
            "ir" => kind.ir = true,
            "fe" => kind.ir = false,
            "csir" => {
                kind.ir = true;
                kind.cs = true;
            }
            "entry_first" => kind.entry_first = true,
            "not_entry_first" => kind.entry_first = false,
            _ => return Err(malformed(line_no, "a header flag", line)),
        }
        lines.next();
    }

    Ok(kind)
}

/// Reads only the header lines of a text profile.
pub(crate) fn peek_kind(data: &[u8]) -> Result<ProfileKind, Error> {
    let text = std::str::from_utf8(data).map_err(|e| {
        Error::new(ErrorKind::InvalidEncoding)
            .at_offset(e.valid_up_to())
            .with_source(e)
    })?;
    parse_header(&mut Lines::new(text))
}

fn parse_value_profile(lines: &mut Lines<'_>) -> Result<ValueProfile, Error> {
    let mut profile = ValueProfile::default();

    let num_kinds = lines.expect_int("the number of value kinds")?;
    for _ in 0..num_kinds {
        let (line_no, line) = lines.expect("a value kind")?;
        let kind = parse_int(line)
            .and_then(|kind| u32::try_from(kind).ok())
            .and_then(ValueKind::from_u32)
            .ok_or_else(|| malformed(line_no, "a value kind", line))?;

        let num_sites = lines.expect_int("the number of value sites")?;
        let sites = profile.sites_mut(kind);
        for _ in 0..num_sites {
            let num_values = lines.expect_int("the number of values")?;
            let mut site = Vec::new();
            for _ in 0..num_values {
                let (line_no, line) = lines.expect("a value and count")?;
                let data = line
                    .split_once(':')
                    .and_then(|(value, count)| {
                        Some(ValueData {
                            value: parse_int(value.trim())?,
                            count: parse_int(count.trim())?,
                        })
                    })
                    .ok_or_else(|| malformed(line_no, "a value and count", line))?;
                site.push(data);
            }
            sites.push(site);
        }
    }

    Ok(profile)
}

/// Parses one function block. The outer error is fatal, the inner one affects only this block.
fn parse_block(
    lines: &mut Lines<'_>,
    name_line: Line<'_>,
) -> Result<Result<FunctionRecord, Error>, Error> {
    let (line_no, name) = name_line;
    if name.starts_with(':') {
        return Err(malformed(line_no, "a function name", name));
    }

    let hash = lines.expect_int("a function hash")?;
    let (count_line, line) = lines.expect("the number of counters")?;
    let declared = parse_int(line).ok_or_else(|| malformed(count_line, "a counter count", line))?;

    let mut counters = Vec::new();
    while let Some(value) = lines.peek().and_then(|(_, line)| parse_int(line)) {
        counters.push(value);
        lines.next();
    }

    let values = match lines.peek() {
        Some((_, VALUE_PROFILE_MARKER)) => {
            lines.next();
            Some(parse_value_profile(lines)?)
        }
        _ => None,
    };

    if counters.len() as u64 != declared {
        return Ok(Err(Error::new(ErrorKind::CounterCountMismatch)
            .at_line(count_line)
            .in_function(name, hash)
            .with_detail(format!(
                "declared {declared} counters, found {}",
                counters.len()
            ))));
    }

    Ok(Ok(FunctionRecord {
        name: name.to_owned(),
        hash,
        counters,
        values,
    }))
}

/// Parses a text profile.
///
/// Blocks whose counter count does not match the declared count fail with
/// [`ErrorKind::CounterCountMismatch`] and are skipped in best-effort mode. Lines that do not
/// match the grammar always fail with [`ErrorKind::MalformedLine`].
#[tracing::instrument(level = "trace", name = "text::parse", skip_all)]
pub fn parse(data: &[u8], options: &ReadOptions) -> Result<InstrProfile, Error> {
    let text = std::str::from_utf8(data).map_err(|e| {
        Error::new(ErrorKind::InvalidEncoding)
            .at_offset(e.valid_up_to())
            .with_source(e)
    })?;

    let mut lines = Lines::new(text);
    let mut profile = InstrProfile::new(ProfileFormat::Text);
    profile.kind = parse_header(&mut lines)?;

    while let Some(name_line) = lines.next() {
        match parse_block(&mut lines, name_line)? {
            Ok(record) => profile.records.push(record),
            Err(error) => options.recover(error, &mut profile.skipped)?,
        }
    }

    tracing::debug!(records = profile.records.len(), "parsed text profile");
    Ok(profile)
}

/// Renders a profile in the text format.
///
/// The output parses back into the same records and variant flags, except that a value profile
/// without any sites reads back as `None`. Names that the reader would skip or misread as a header
/// fail with [`ErrorKind::WriteFailed`]: empty names, names with surrounding whitespace or line
/// breaks, and names starting with `#` or `:`.
pub fn write_text(profile: &InstrProfile) -> Result<String, Error> {
    for record in &profile.records {
        if !is_writable_name(&record.name) {
            return Err(Error::new(ErrorKind::WriteFailed)
                .in_function(record.name.clone(), record.hash)
                .with_detail("function name cannot be stored in a text profile"));
        }
    }

    let mut out = String::new();
    // writing into a `String` cannot fail
    let _ = write_profile(profile, &mut out);
    Ok(out)
}

fn is_writable_name(name: &str) -> bool {
    !name.is_empty()
        && name.trim() == name
        && !name.contains(['\n', '\r'])
        && !name.starts_with(['#', ':'])
}

fn write_profile(profile: &InstrProfile, out: &mut String) -> std::fmt::Result {
    if profile.kind.cs {
        writeln!(out, "# CSIR level Instrumentation Flag")?;
        writeln!(out, ":csir")?;
    } else if profile.kind.ir {
        writeln!(out, "# IR level Instrumentation Flag")?;
        writeln!(out, ":ir")?;
    } else {
        writeln!(out, "# Front-end level Instrumentation Flag")?;
        writeln!(out, ":fe")?;
    }
    if profile.kind.entry_first {
        writeln!(out, ":entry_first")?;
    }

    for record in &profile.records {
        writeln!(out, "{}", record.name)?;
        writeln!(out, "# Func Hash:")?;
        writeln!(out, "{}", record.hash)?;
        writeln!(out, "# Num Counters:")?;
        writeln!(out, "{}", record.counters.len())?;
        writeln!(out, "# Counter Values:")?;
        for counter in &record.counters {
            writeln!(out, "{counter}")?;
        }

        if let Some(ref values) = record.values {
            let kinds: Vec<_> = ValueKind::ALL
                .into_iter()
                .filter(|&kind| !values.sites(kind).is_empty())
                .collect();
            if !kinds.is_empty() {
                writeln!(out, "{VALUE_PROFILE_MARKER}")?;
                writeln!(out, "# Num Value Kinds:")?;
                writeln!(out, "{}", kinds.len())?;
                for kind in kinds {
                    writeln!(out, "# ValueKind = {kind:?}:")?;
                    writeln!(out, "{}", kind.as_u32())?;
                    writeln!(out, "# NumValueSites:")?;
                    writeln!(out, "{}", values.sites(kind).len())?;
                    for site in values.sites(kind) {
                        writeln!(out, "{}", site.len())?;
                        for data in site {
                            writeln!(out, "{}:{}", data.value, data.count)?;
                        }
                    }
                }
            }
        }

        writeln!(out)?;
    }

    Ok(())
}
