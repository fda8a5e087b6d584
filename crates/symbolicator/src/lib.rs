#![cfg_attr(not(test), no_std)]

//! A flat table of function symbols, searched by address.
//!
//! The host tool writes one from the kernel ELF; the kernel receives it as a boot module and uses
//! [`SymbolTable::lookup`] to name return addresses in a traceback. Reading never allocates and
//! never assumes the buffer is aligned.
//!
//! Layout, all little-endian:
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 8    | magic, `KSYMTAB\0`                     |
//! | 8      | 4    | symbol count                           |
//! | 12     | 4    | reserved                               |
//! | 16     | 8    | string pool offset                     |
//! | 24     | 8    | string pool size                       |
//! | 32     | 24×n | symbols, sorted by address             |
//!
//! Each symbol is `address: u64, size: u64, name_offset: u32, name_length: u32`, the name being a
//! UTF-8 slice of the string pool. A symbol of size zero covers everything up to the next one.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

const MAGIC: &[u8; 8] = b"KSYMTAB\0";
const HEADER_SIZE: usize = 32;
const ENTRY_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Shorter than a header.
    TooSmall,
    BadMagic,
    /// The header points past the end of the data.
    Truncated,
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::TooSmall => f.write_str("too small for a symbol table header"),
            TableError::BadMagic => f.write_str("not a symbol table (bad magic)"),
            TableError::Truncated => f.write_str("symbol table is truncated"),
        }
    }
}

impl core::error::Error for TableError {}

/// A name and how far into it an address falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol<'a> {
    pub name: &'a str,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    address: u64,
    size: u64,
    name_offset: u32,
    name_length: u32,
}

impl Entry {
    fn read(raw: &[u8]) -> Self {
        Self {
            address: read_u64(raw, 0),
            size: read_u64(raw, 8),
            name_offset: read_u32(raw, 16),
            name_length: read_u32(raw, 20),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.name_offset.to_le_bytes());
        out.extend_from_slice(&self.name_length.to_le_bytes());
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

/// A validated view over a symbol table image.
#[derive(Clone, Copy)]
pub struct SymbolTable<'a> {
    entries: &'a [u8],
    pool: &'a [u8],
}

impl<'a> SymbolTable<'a> {
    /// Checks the header and that every table it describes lies inside `data`.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, TableError> {
        let header = data.get(..HEADER_SIZE).ok_or(TableError::TooSmall)?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(TableError::BadMagic);
        }
        let count = read_u32(header, 8) as usize;
        let pool_offset = read_u64(header, 16) as usize;
        let pool_size = read_u64(header, 24) as usize;

        let entries_end = count
            .checked_mul(ENTRY_SIZE)
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
            .ok_or(TableError::Truncated)?;
        let entries = data.get(HEADER_SIZE..entries_end).ok_or(TableError::Truncated)?;
        let pool_end = pool_offset
            .checked_add(pool_size)
            .ok_or(TableError::Truncated)?;
        let pool = data.get(pool_offset..pool_end).ok_or(TableError::Truncated)?;
        Ok(Self { entries, pool })
    }

    pub fn len(&self) -> usize {
        self.entries.len() / ENTRY_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, index: usize) -> Entry {
        Entry::read(&self.entries[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE])
    }

    /// The symbol with the highest address at or below `address`, if `address` falls inside it.
    pub fn lookup(&self, address: u64) -> Option<Symbol<'a>> {
        let (mut low, mut high) = (0, self.len());
        while low < high {
            let middle = low + (high - low) / 2;
            if self.entry(middle).address <= address {
                low = middle + 1;
            } else {
                high = middle;
            }
        }
        let entry = self.entry(low.checked_sub(1)?);
        let offset = address - entry.address;
        if entry.size != 0 && offset >= entry.size {
            return None;
        }
        Some(Symbol {
            name: self.name(&entry)?,
            offset,
        })
    }

    fn name(&self, entry: &Entry) -> Option<&'a str> {
        let start = entry.name_offset as usize;
        let end = start.checked_add(entry.name_length as usize)?;
        core::str::from_utf8(self.pool.get(start..end)?).ok()
    }
}

/// Collects symbols in any order and writes the sorted table.
#[derive(Default)]
pub struct SymbolTableBuilder {
    entries: Vec<Entry>,
    strings: Vec<u8>,
}

impl SymbolTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a symbol. Names that would overflow the string pool are dropped.
    pub fn add(&mut self, address: u64, size: u64, name: &str) {
        let (Ok(name_offset), Ok(name_length)) =
            (u32::try_from(self.strings.len()), u32::try_from(name.len()))
        else {
            return;
        };
        self.strings.extend_from_slice(name.as_bytes());
        self.entries.push(Entry {
            address,
            size,
            name_offset,
            name_length,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorts by address and serializes. Where several symbols share an address, the largest one
    /// wins, so aliases with no size never hide the real function.
    pub fn build(mut self) -> Vec<u8> {
        self.entries
            .sort_by(|a, b| a.address.cmp(&b.address).then(b.size.cmp(&a.size)));
        self.entries.dedup_by_key(|entry| entry.address);

        let pool_offset = HEADER_SIZE + self.entries.len() * ENTRY_SIZE;
        let mut out = Vec::with_capacity(pool_offset + self.strings.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(pool_offset as u64).to_le_bytes());
        out.extend_from_slice(&(self.strings.len() as u64).to_le_bytes());
        for entry in &self.entries {
            entry.write(&mut out);
        }
        out.extend_from_slice(&self.strings);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut builder = SymbolTableBuilder::new();
        builder.add(0xffff_ffff_8000_2000, 0x80, "kestrel_kernel::tasks::idle");
        builder.add(0xffff_ffff_8000_1000, 0x100, "kestrel_kernel::kernel_main");
        builder.add(0xffff_ffff_8000_3000, 0, "_start_trampoline");
        builder.build()
    }

    #[test]
    fn finds_the_enclosing_function() {
        let data = sample();
        let table = SymbolTable::from_bytes(&data).unwrap();
        assert_eq!(table.len(), 3);

        assert_eq!(
            table.lookup(0xffff_ffff_8000_1000),
            Some(Symbol {
                name: "kestrel_kernel::kernel_main",
                offset: 0
            })
        );
        assert_eq!(
            table.lookup(0xffff_ffff_8000_2042),
            Some(Symbol {
                name: "kestrel_kernel::tasks::idle",
                offset: 0x42
            })
        );
    }

    #[test]
    fn addresses_outside_every_function_are_unknown() {
        let data = sample();
        let table = SymbolTable::from_bytes(&data).unwrap();

        assert_eq!(table.lookup(0x1000), None);
        assert_eq!(table.lookup(0xffff_ffff_8000_0fff), None);
        // Past the end of kernel_main, before idle.
        assert_eq!(table.lookup(0xffff_ffff_8000_1100), None);
        assert_eq!(table.lookup(0xffff_ffff_8000_2080), None);
    }

    #[test]
    fn unsized_symbols_run_to_the_next_one() {
        let data = sample();
        let table = SymbolTable::from_bytes(&data).unwrap();
        let symbol = table.lookup(0xffff_ffff_8000_3abc).unwrap();
        assert_eq!(symbol.name, "_start_trampoline");
        assert_eq!(symbol.offset, 0xabc);
    }

    #[test]
    fn aliases_keep_the_sized_symbol() {
        let mut builder = SymbolTableBuilder::new();
        builder.add(0x4000, 0, "alias");
        builder.add(0x4000, 0x40, "real");
        builder.add(0x4000, 0, "another_alias");
        let data = builder.build();
        let table = SymbolTable::from_bytes(&data).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(0x4010).map(|s| s.name), Some("real"));
        assert_eq!(table.lookup(0x4040), None);
    }

    #[test]
    fn empty_table_resolves_nothing() {
        let data = SymbolTableBuilder::new().build();
        let table = SymbolTable::from_bytes(&data).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.lookup(0xffff_ffff_8000_0000), None);
    }

    #[test]
    fn rejects_malformed_images() {
        assert_eq!(
            SymbolTable::from_bytes(b"KSYMTAB").err(),
            Some(TableError::TooSmall)
        );

        let mut data = sample();
        data[0] = b'X';
        assert_eq!(
            SymbolTable::from_bytes(&data).err(),
            Some(TableError::BadMagic)
        );

        let data = sample();
        assert_eq!(
            SymbolTable::from_bytes(&data[..data.len() - 1]).err(),
            Some(TableError::Truncated)
        );
        assert_eq!(
            SymbolTable::from_bytes(&data[..HEADER_SIZE + ENTRY_SIZE]).err(),
            Some(TableError::Truncated)
        );
    }

    #[test]
    fn unaligned_images_are_readable() {
        let data = sample();
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&data);
        let table = SymbolTable::from_bytes(&shifted[1..]).unwrap();
        assert_eq!(
            table.lookup(0xffff_ffff_8000_1010).map(|s| s.name),
            Some("kestrel_kernel::kernel_main")
        );
    }
}
