use std::cell::Cell;
use std::collections::BTreeMap;
use std::io::Read;
use std::{error, fmt};

use bitflags::bitflags;
use serde_json::Value;

use crate::annotations::Label;

#[derive(Debug)]
pub enum Error {
    /// The address is not covered by any loaded area.
    InvalidAddr(u64),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddr(addr) => write!(f, "invalid address 0x{addr:08x}"),
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

bitflags! {
    /// Classification of one byte of the address space.
    ///
    /// The head values (`CODE`, `DATA`, `STR`) and their continuations are
    /// disjoint tags rather than independent bits; the upper bits are
    /// reserved for orthogonal flags, which is why `make_code`/`make_data`
    /// write the head with `|=`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const CODE = 0x01;
        const CODE_CONT = 0x02;
        const DATA = 0x04;
        const DATA_CONT = 0x08;
        /// String head; continuation bytes reuse `DATA_CONT`.
        const STR = 0x10;
    }
}

impl Flags {
    pub const UNK: Flags = Flags::empty();
}

/// Opaque per-area descriptor supplied by the loader and passed through
/// unchanged: a human-readable name and access bits such as `"rwx"`.
#[derive(Debug, Clone, Default)]
pub struct AreaProps {
    pub name: String,
    pub access: String,
}

/// A contiguous loaded byte range `[start, end]` with its raw content and a
/// parallel per-byte flag buffer.
#[derive(Debug)]
pub struct Area {
    pub start: u64,
    /// Inclusive end address.
    pub end: u64,
    pub props: AreaProps,
    pub(crate) bytes: Vec<u8>,
    pub(crate) flags: Vec<Flags>,
}

impl Area {
    #[must_use]
    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr <= self.end
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn flags(&self) -> &[Flags] {
        &self.flags
    }

    /// Taking an offset inside a unit, return the offset of the unit head.
    ///
    /// Walks backwards while the flag at the offset is a continuation, so it
    /// lands either on a head flag or on offset 0.
    #[must_use]
    pub fn adjust_offset_reverse(&self, mut off: usize) -> usize {
        while off > 0 {
            let f = self.flags[off];
            if f == Flags::CODE_CONT || f == Flags::DATA_CONT {
                off -= 1;
            } else {
                break;
            }
        }
        off
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Area(0x{:x}-0x{:x}, {} {})",
            self.start, self.end, self.props.name, self.props.access
        )
    }
}

/// The byte/flag store: a list of non-overlapping areas plus the annotation
/// tables (labels, comments, xrefs, operand properties; see the
/// `annotations` module for their API).
///
/// Addresses outside every area are invalid; reads and flag access at such
/// addresses fail with [`Error::InvalidAddr`].
pub struct AddressSpace {
    pub(crate) areas: Vec<Area>,
    pub(crate) labels: BTreeMap<u64, Label>,
    pub(crate) comments: BTreeMap<u64, String>,
    /// Target address → source address → tag.
    pub(crate) xrefs: BTreeMap<u64, BTreeMap<u64, String>>,
    /// Address → operand index → property name → value.
    pub(crate) arg_props: BTreeMap<u64, BTreeMap<u32, BTreeMap<String, Value>>>,
    /// One-slot cache of the last resolved area.
    last_area: Cell<Option<usize>>,
}

impl AddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self {
            areas: Vec::new(),
            labels: BTreeMap::new(),
            comments: BTreeMap::new(),
            xrefs: BTreeMap::new(),
            arg_props: BTreeMap::new(),
            last_area: Cell::new(None),
        }
    }

    /// Append a new area. The caller guarantees non-overlap with the
    /// existing areas; areas are never resized afterwards.
    pub fn add_area(&mut self, start: u64, end: u64, props: AreaProps) -> &Area {
        assert!(start <= end, "area 0x{start:x}-0x{end:x} is inverted");
        debug_assert!(
            self.areas.iter().all(|a| end < a.start || start > a.end),
            "area 0x{start:x}-0x{end:x} overlaps an existing area"
        );
        let sz = (end - start + 1) as usize;
        self.areas.push(Area {
            start,
            end,
            props,
            bytes: vec![0; sz],
            flags: vec![Flags::UNK; sz],
        });
        self.areas.last().unwrap()
    }

    #[must_use]
    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    #[must_use]
    pub fn area(&self, no: usize) -> &Area {
        &self.areas[no]
    }

    #[must_use]
    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    /// Start of the first area, the lowest valid address.
    #[must_use]
    pub fn min_addr(&self) -> u64 {
        self.areas[0].start
    }

    fn find_area(&self, addr: u64) -> Option<usize> {
        if let Some(no) = self.last_area.get() {
            if self.areas[no].contains(addr) {
                return Some(no);
            }
        }
        // Area count is small (tens), a scan is fine.
        let no = self.areas.iter().position(|a| a.contains(addr))?;
        self.last_area.set(Some(no));
        Some(no)
    }

    /// Resolve an address to `(offset, area)`.
    #[must_use]
    pub fn addr2area(&self, addr: u64) -> Option<(usize, &Area)> {
        let no = self.find_area(addr)?;
        let area = &self.areas[no];
        Some(((addr - area.start) as usize, area))
    }

    /// Index of the area containing `addr` in `add_area` order.
    #[must_use]
    pub fn area_index(&self, addr: u64) -> Option<usize> {
        self.find_area(addr)
    }

    /// Index of `area` itself in `add_area` order. The reference must come
    /// from this address space.
    #[must_use]
    pub fn area_no(&self, area: &Area) -> usize {
        self.areas
            .iter()
            .position(|a| std::ptr::eq(a, area))
            .expect("area does not belong to this address space")
    }

    #[must_use]
    pub fn is_valid_addr(&self, addr: u64) -> bool {
        self.find_area(addr).is_some()
    }

    /// Fill area bytes starting at `addr` from a byte source. With
    /// `sz == None` fills up to the end of the containing area. A source
    /// shorter than the destination is not an error; returns the number of
    /// bytes actually read.
    pub fn load_content<R: Read>(
        &mut self,
        reader: &mut R,
        addr: u64,
        sz: Option<usize>,
    ) -> Result<usize, Error> {
        let no = self.find_area(addr).ok_or(Error::InvalidAddr(addr))?;
        let area = &mut self.areas[no];
        let off = (addr - area.start) as usize;
        let end_addr = area.end;
        let buf = match sz {
            Some(sz) => area
                .bytes
                .get_mut(off..off + sz)
                .ok_or(Error::InvalidAddr(end_addr + 1))?,
            None => &mut area.bytes[off..],
        };
        let mut total = 0;
        while total < buf.len() {
            let n = reader.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    pub fn get_byte(&self, addr: u64) -> Result<u8, Error> {
        let (off, area) = self.addr2area(addr).ok_or(Error::InvalidAddr(addr))?;
        Ok(area.bytes[off])
    }

    /// Read up to `sz` bytes at `addr`; the slice is truncated at the end of
    /// the containing area.
    pub fn get_bytes(&self, addr: u64, sz: usize) -> Result<&[u8], Error> {
        let (off, area) = self.addr2area(addr).ok_or(Error::InvalidAddr(addr))?;
        let end = (off + sz).min(area.bytes.len());
        Ok(&area.bytes[off..end])
    }

    /// Read a little-endian integer of `sz` bytes (1, 2 or 4).
    pub fn get_data(&self, addr: u64, sz: usize) -> Result<u64, Error> {
        debug_assert!(matches!(sz, 1 | 2 | 4), "unsupported data size {sz}");
        let (off, area) = self.addr2area(addr).ok_or(Error::InvalidAddr(addr))?;
        if off + sz > area.bytes.len() {
            return Err(Error::InvalidAddr(area.end + 1));
        }
        let mut val = 0u64;
        for (i, b) in area.bytes[off..off + sz].iter().take(8).enumerate() {
            val |= u64::from(*b) << (8 * i);
        }
        Ok(val)
    }

    pub fn get_flags(&self, addr: u64) -> Result<Flags, Error> {
        let (off, area) = self.addr2area(addr).ok_or(Error::InvalidAddr(addr))?;
        Ok(area.flags[off])
    }

    /// Write `head` at `addr` and `rest` at the following `sz - 1`
    /// positions, replacing whatever was there.
    pub fn set_flags(&mut self, addr: u64, sz: usize, head: Flags, rest: Flags) -> Result<(), Error> {
        let no = self.find_area(addr).ok_or(Error::InvalidAddr(addr))?;
        let area = &mut self.areas[no];
        let off = (addr - area.start) as usize;
        if off + sz > area.flags.len() {
            return Err(Error::InvalidAddr(area.end + 1));
        }
        area.flags[off] = head;
        for f in &mut area.flags[off + 1..off + sz] {
            *f = rest;
        }
        Ok(())
    }

    pub fn make_undefined(&mut self, addr: u64, sz: usize) -> Result<(), Error> {
        self.set_flags(addr, sz, Flags::UNK, Flags::UNK)
    }

    /// Mark `[addr, addr + sz)` as a code unit. The head keeps any
    /// orthogonal upper bits already present (bitwise OR).
    pub fn make_code(&mut self, addr: u64, sz: usize) -> Result<(), Error> {
        let no = self.find_area(addr).ok_or(Error::InvalidAddr(addr))?;
        let area = &mut self.areas[no];
        let off = (addr - area.start) as usize;
        if off + sz > area.flags.len() {
            return Err(Error::InvalidAddr(area.end + 1));
        }
        area.flags[off] |= Flags::CODE;
        for f in &mut area.flags[off + 1..off + sz] {
            *f |= Flags::CODE_CONT;
        }
        Ok(())
    }

    /// Mark `[addr, addr + sz)` as a data unit, OR semantics as `make_code`.
    pub fn make_data(&mut self, addr: u64, sz: usize) -> Result<(), Error> {
        let no = self.find_area(addr).ok_or(Error::InvalidAddr(addr))?;
        let area = &mut self.areas[no];
        let off = (addr - area.start) as usize;
        if off + sz > area.flags.len() {
            return Err(Error::InvalidAddr(area.end + 1));
        }
        area.flags[off] |= Flags::DATA;
        for f in &mut area.flags[off + 1..off + sz] {
            *f |= Flags::DATA_CONT;
        }
        Ok(())
    }

    /// Length of the unit starting at `addr`.
    ///
    /// The contract is a query at a unit head: the length is 1 plus the run
    /// of matching continuation flags, truncated at the area end. Queried at
    /// an `UNK` byte, or mid-unit where the head check fails, it returns 1.
    pub fn get_unit_size(&self, addr: u64) -> Result<usize, Error> {
        let (off, area) = self.addr2area(addr).ok_or(Error::InvalidAddr(addr))?;
        let flags = area.flags();
        let cont = if flags[off] == Flags::CODE {
            Flags::CODE_CONT
        } else if flags[off] == Flags::DATA || flags[off] == Flags::STR {
            Flags::DATA_CONT
        } else {
            return Ok(1);
        };
        let mut sz = 1;
        let mut off = off + 1;
        while off < flags.len() && flags[off] == cont {
            off += 1;
            sz += 1;
        }
        Ok(sz)
    }

    /// Clear the whole unit starting at `addr` back to `UNK`.
    pub fn undefine_unit(&mut self, addr: u64) -> Result<(), Error> {
        let sz = self.get_unit_size(addr)?;
        self.make_undefined(addr, sz)
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_addr_resolution() {
    let mut space = AddressSpace::new();
    space.add_area(0x100, 0x1ff, AreaProps::default());
    space.add_area(0x400, 0x4ff, AreaProps::default());

    assert_eq!(space.min_addr(), 0x100);
    assert!(space.is_valid_addr(0x100));
    assert!(space.is_valid_addr(0x1ff));
    assert!(!space.is_valid_addr(0x200));
    assert!(space.is_valid_addr(0x400));

    let (off, area) = space.addr2area(0x1f0).unwrap();
    assert_eq!(off, 0xf0);
    assert_eq!(area.start, 0x100);
    // Second lookup comes from the one-slot cache.
    let (off, _) = space.addr2area(0x1f1).unwrap();
    assert_eq!(off, 0xf1);
    assert_eq!(space.area_index(0x420), Some(1));
    assert_eq!(space.area_index(0x300), None);

    let (_, area) = space.addr2area(0x420).unwrap();
    assert_eq!(space.area_no(area), 1);
    assert_eq!(space.area_no(space.area(0)), 0);
}

#[test]
fn test_load_and_read() {
    let mut space = AddressSpace::new();
    space.add_area(0x10, 0x1f, AreaProps::default());
    let content = [0x11u8, 0x22, 0x33, 0x44];
    let n = space.load_content(&mut &content[..], 0x12, None).unwrap();
    assert_eq!(n, 4);

    assert_eq!(space.get_byte(0x12).unwrap(), 0x11);
    assert_eq!(space.get_byte(0x15).unwrap(), 0x44);
    assert_eq!(space.get_byte(0x16).unwrap(), 0);
    assert_eq!(space.get_bytes(0x12, 4).unwrap(), &content);
    assert_eq!(space.get_data(0x12, 1).unwrap(), 0x11);
    assert_eq!(space.get_data(0x12, 2).unwrap(), 0x2211);
    assert_eq!(space.get_data(0x12, 4).unwrap(), 0x44332211);
    assert!(matches!(space.get_byte(0x30), Err(Error::InvalidAddr(0x30))));
    assert!(space.get_data(0x1e, 4).is_err());
}

#[test]
fn test_unit_navigation() {
    let mut space = AddressSpace::new();
    space.add_area(0, 9, AreaProps::default());

    space.make_data(2, 4).unwrap();
    assert_eq!(space.get_flags(2).unwrap(), Flags::DATA);
    assert_eq!(space.get_flags(3).unwrap(), Flags::DATA_CONT);
    assert_eq!(space.get_unit_size(2).unwrap(), 4);
    // Mid-unit query fails the head check and reports 1.
    assert_eq!(space.get_unit_size(3).unwrap(), 1);
    assert_eq!(space.get_unit_size(0).unwrap(), 1);

    let area = space.area(0);
    assert_eq!(area.adjust_offset_reverse(4), 2);
    assert_eq!(area.adjust_offset_reverse(2), 2);
    assert_eq!(area.adjust_offset_reverse(0), 0);

    space.make_code(6, 3).unwrap();
    assert_eq!(space.get_unit_size(6).unwrap(), 3);
    assert_eq!(space.get_flags(7).unwrap(), Flags::CODE_CONT);

    space.make_undefined(2, 4).unwrap();
    for addr in 2..6 {
        assert_eq!(space.get_flags(addr).unwrap(), Flags::UNK);
    }
    assert_eq!(space.get_unit_size(2).unwrap(), 1);
}

#[test]
fn test_unit_truncated_at_area_end() {
    let mut space = AddressSpace::new();
    space.add_area(0, 7, AreaProps::default());
    space.make_code(6, 2).unwrap();
    assert_eq!(space.get_unit_size(6).unwrap(), 2);
    assert!(space.make_code(6, 3).is_err());
}

#[test]
fn test_undefine_unit() {
    let mut space = AddressSpace::new();
    space.add_area(0, 9, AreaProps::default());
    space.make_data(2, 4).unwrap();
    space.undefine_unit(2).unwrap();
    assert_eq!(space.get_flags(2).unwrap(), Flags::UNK);
    assert_eq!(space.get_flags(5).unwrap(), Flags::UNK);
}
