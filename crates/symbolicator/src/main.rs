use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use elf::{ElfBytes, abi::STT_FUNC, endian::LittleEndian};

use symbolicator::{SymbolTable, SymbolTableBuilder};

#[derive(Parser)]
#[command(name = "symbolicator")]
#[command(about = "Builds and queries Kestrel kernel symbol tables")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a symbol table from the kernel ELF (it must not be stripped)
    Generate {
        /// Kernel ELF image
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the table; boot it as the `kernel_symbols` module
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Look up an address in a symbol table
    Lookup {
        /// Symbol table file
        #[arg(short, long)]
        symtab: PathBuf,

        /// Address in hexadecimal, e.g. 0xffffffff80001234
        #[arg(short, long)]
        address: String,
    },
}

fn generate(input: PathBuf, output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(&input)?;
    let image = ElfBytes::<LittleEndian>::minimal_parse(&data)?;
    let (symbols, strings) = image
        .symbol_table()?
        .ok_or("input has no .symtab; was it stripped?")?;

    let mut builder = SymbolTableBuilder::new();
    for symbol in symbols.iter() {
        if symbol.st_symtype() != STT_FUNC || symbol.st_value == 0 {
            continue;
        }
        let raw = strings.get(symbol.st_name as usize)?;
        let name = format!("{:#}", rustc_demangle::demangle(raw));
        builder.add(symbol.st_value, symbol.st_size, &name);
    }

    let count = builder.len();
    fs::write(&output, builder.build())?;
    println!("{count} functions written to {}", output.display());
    Ok(())
}

fn lookup(symtab: PathBuf, address: String) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(&symtab)?;
    let table = SymbolTable::from_bytes(&data)?;
    let address = u64::from_str_radix(address.trim_start_matches("0x"), 16)?;

    match table.lookup(address) {
        Some(symbol) => println!("{address:#018x} {}+{:#x}", symbol.name, symbol.offset),
        None => println!("{address:#018x} <unknown>"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    match args.command {
        Command::Generate { input, output } => generate(input, output),
        Command::Lookup { symtab, address } => lookup(symtab, address),
    }
}
