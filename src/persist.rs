//! Text persistence for the annotation tables and area flags.
//!
//! All formats are line-based ASCII with LF terminators; addresses are
//! lowercase zero-padded 8-hex. Table contents are written sorted by
//! address, areas in `add_area` order.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::{error, fmt, io};

use serde_json::Value;

use crate::annotations::Label;
use crate::space::{AddressSpace, Flags};

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Json(serde_json::Error),
    /// Bad hex, a truncated line, or a key that does not parse back.
    Malformed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::Json(err) => err.fmt(f),
            Self::Malformed(what) => write!(f, "malformed input: {what}"),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

fn parse_addr(s: &str) -> Result<u64, Error> {
    u64::from_str_radix(s, 16).map_err(|_| Error::Malformed(format!("bad address {s:?}")))
}

fn split_addr_line(line: &str) -> Result<(u64, &str), Error> {
    let (addr, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| Error::Malformed(format!("truncated line {line:?}")))?;
    Ok((parse_addr(addr)?, rest))
}

impl AddressSpace {
    /// One line per label: `<addr>` alone denotes an auto-label,
    /// `<addr> <string>` a user label.
    pub fn save_labels<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        for (addr, label) in &self.labels {
            match label {
                Label::Auto => writeln!(w, "{addr:08x}")?,
                Label::User(s) => writeln!(w, "{addr:08x} {s}")?,
            }
        }
        Ok(())
    }

    pub fn load_labels<R: BufRead>(&mut self, r: &mut R) -> Result<(), Error> {
        for line in r.lines() {
            let line = line?;
            let mut vals = line.split_whitespace();
            let Some(addr) = vals.next() else {
                continue;
            };
            let addr = parse_addr(addr)?;
            let label = match vals.next() {
                Some(s) => Label::User(s.to_string()),
                None => Label::Auto,
            };
            self.labels.insert(addr, label);
        }
        Ok(())
    }

    /// `<addr> <json-string>` per comment.
    pub fn save_comments<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        for (addr, comment) in &self.comments {
            writeln!(w, "{addr:08x} {}", serde_json::to_string(comment)?)?;
        }
        Ok(())
    }

    pub fn load_comments<R: BufRead>(&mut self, r: &mut R) -> Result<(), Error> {
        for line in r.lines() {
            let line = line?;
            let (addr, rest) = split_addr_line(&line)?;
            self.comments.insert(addr, serde_json::from_str(rest)?);
        }
        Ok(())
    }

    /// `<addr> <json-object>` per address; JSON keys are operand indices
    /// encoded as strings.
    pub fn save_arg_props<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        for (addr, args) in &self.arg_props {
            let mut obj = serde_json::Map::new();
            for (arg_no, props) in args {
                let props = props
                    .iter()
                    .map(|(name, val)| (name.clone(), val.clone()))
                    .collect();
                obj.insert(arg_no.to_string(), Value::Object(props));
            }
            writeln!(w, "{addr:08x} {}", Value::Object(obj))?;
        }
        Ok(())
    }

    pub fn load_arg_props<R: BufRead>(&mut self, r: &mut R) -> Result<(), Error> {
        for line in r.lines() {
            let line = line?;
            let (addr, rest) = split_addr_line(&line)?;
            let obj: serde_json::Map<String, Value> = serde_json::from_str(rest)?;
            let mut args: BTreeMap<u32, BTreeMap<String, Value>> = BTreeMap::new();
            for (arg_no, props) in obj {
                // JSON can't have numeric keys; parse them back.
                let arg_no: u32 = arg_no
                    .parse()
                    .map_err(|_| Error::Malformed(format!("bad operand index {arg_no:?}")))?;
                let Value::Object(props) = props else {
                    return Err(Error::Malformed(format!(
                        "properties of operand {arg_no} are not an object"
                    )));
                };
                args.insert(arg_no, props.into_iter().collect());
            }
            self.arg_props.insert(addr, args);
        }
        Ok(())
    }

    /// Per target address: a `<addr>` line, one `<from-addr> <tag>` line per
    /// source, then a blank line.
    pub fn save_xrefs<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        for (addr, sources) in &self.xrefs {
            writeln!(w, "{addr:08x}")?;
            for (from, tag) in sources {
                writeln!(w, "{from:08x} {tag}")?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    pub fn load_xrefs<R: BufRead>(&mut self, r: &mut R) -> Result<(), Error> {
        let mut line = String::new();
        loop {
            line.clear();
            if r.read_line(&mut line)? == 0 || line.trim_end().is_empty() {
                break;
            }
            let target = parse_addr(line.trim_end())?;
            loop {
                line.clear();
                if r.read_line(&mut line)? == 0 || line.trim_end().is_empty() {
                    break;
                }
                let (from, tag) = split_addr_line(line.trim_end())?;
                self.xrefs
                    .entry(target)
                    .or_default()
                    .insert(from, tag.to_string());
            }
        }
        Ok(())
    }

    /// Per area: a `<start> <end>` line, the flag bytes hex-encoded in
    /// 32-byte chunks (one chunk per line), then a blank line.
    pub fn save_areas<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        for area in &self.areas {
            writeln!(w, "{:08x} {:08x}", area.start, area.end)?;
            for chunk in area.flags.chunks(32) {
                for f in chunk {
                    write!(w, "{:02x}", f.bits())?;
                }
                writeln!(w)?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    /// Load flags back into the in-memory areas. The stream must describe
    /// the same areas in the same order; a header mismatch is fatal.
    pub fn load_areas<R: BufRead>(&mut self, r: &mut R) -> Result<(), Error> {
        let mut line = String::new();
        for no in 0..self.areas.len() {
            line.clear();
            if r.read_line(&mut line)? == 0 {
                return Err(Error::Malformed("missing area header".to_string()));
            }
            let (start, rest) = split_addr_line(line.trim_end())?;
            let end = parse_addr(rest)?;
            let area = &mut self.areas[no];
            assert_eq!(
                (start, end),
                (area.start, area.end),
                "flag stream does not match area {no}"
            );
            let mut off = 0;
            loop {
                line.clear();
                if r.read_line(&mut line)? == 0 || line.trim_end().is_empty() {
                    break;
                }
                let hex = line.trim_end().as_bytes();
                if hex.len() % 2 != 0 || off + hex.len() / 2 > area.flags.len() {
                    return Err(Error::Malformed(format!(
                        "bad flag chunk at offset 0x{off:x} of area {no}"
                    )));
                }
                for pair in hex.chunks(2) {
                    let b = std::str::from_utf8(pair)
                        .ok()
                        .and_then(|s| u8::from_str_radix(s, 16).ok())
                        .ok_or_else(|| {
                            Error::Malformed(format!("bad hex in flag chunk of area {no}"))
                        })?;
                    area.flags[off] = Flags::from_bits_retain(b);
                    off += 1;
                }
            }
        }
        Ok(())
    }

    /// Debug dump of the flag map, 128 bytes per line prefixed with the
    /// address.
    pub fn dump_address_map<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        for area in &self.areas {
            for (row_no, row) in area.flags.chunks(128).enumerate() {
                write!(w, "{:08x} ", area.start + (row_no * 128) as u64)?;
                for f in row {
                    write!(w, "{}", flag2char(*f))?;
                }
                writeln!(w)?;
            }
        }
        Ok(())
    }
}

/// One-character rendering of a flag byte for the address-map dump.
#[must_use]
pub fn flag2char(f: Flags) -> char {
    if f == Flags::UNK {
        '.'
    } else if f == Flags::CODE {
        'C'
    } else if f == Flags::CODE_CONT {
        'c'
    } else if f == Flags::DATA {
        'D'
    } else if f == Flags::DATA_CONT {
        'd'
    } else {
        'X'
    }
}
