//! Listing driver.
//!
//! Reads a method listing, runs it through the emitter and prints the
//! instruction groups, the encoded bytes, the GC tables and optionally a
//! disassembly or an ELF object.

use bumpalo::Bump;
use clap::Parser;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use igemit::core::{CompilationSession, EmitterConfig};
use igemit::elf::write_object;
use igemit::listing::{emit_text, EmittedMethod};

#[derive(Parser)]
#[command(name = "igemit")]
#[command(about = "Emit machine code from an instruction listing", long_about = None)]
struct Cli {
    /// Listing to emit (reads stdin when omitted)
    input: Option<PathBuf>,

    /// Close an instruction group after every instruction
    #[arg(long)]
    stress: bool,

    /// Record GC liveness at every instruction instead of only at calls
    #[arg(long)]
    fully_interruptible: bool,

    /// Check group offsets and GC state while emitting
    #[arg(long)]
    validate: bool,

    /// Bytes of per-group instruction scratch space
    #[arg(long)]
    scratch_bytes: Option<usize>,

    /// Write the method as an ELF relocatable
    #[arg(long, value_name = "FILE")]
    elf: Option<PathBuf>,

    /// Disassemble the emitted code
    #[arg(short, long)]
    disasm: bool,

    /// Print session statistics
    #[arg(long)]
    stats: bool,
}

impl Cli {
    fn config(&self) -> EmitterConfig {
        let mut config = EmitterConfig::from_env();
        config.stress_new_groups |= self.stress;
        config.fully_interruptible |= self.fully_interruptible;
        config.validate |= self.validate;
        if let Some(bytes) = self.scratch_bytes {
            config.scratch_capacity = bytes;
        }
        config
    }

    fn read_input(&self) -> io::Result<String> {
        match &self.input {
            Some(path) => fs::read_to_string(path),
            None => {
                let mut text = String::new();
                io::stdin().read_to_string(&mut text)?;
                Ok(text)
            }
        }
    }
}

fn print_bytes(label: &str, base: u32, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    println!("{label}:");
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
        println!("  {:04X}  {}", base as usize + i * 16, hex.join(" "));
    }
}

fn disassemble(method: &EmittedMethod) {
    let code = method.output.code();
    let mut decoder = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut instr = Instruction::default();
    let mut text = String::new();
    println!("disassembly:");
    while decoder.can_decode() {
        decoder.decode_out(&mut instr);
        if let Some((name, _)) = method
            .labels
            .iter()
            .find(|(_, off)| *off as u64 == instr.ip())
        {
            println!("{name}:");
        }
        text.clear();
        formatter.format(&instr, &mut text);
        println!("  {:04X}  {text}", instr.ip());
    }
}

fn report(cli: &Cli, method: &EmittedMethod) {
    let out = &method.output;
    println!(
        "{}: {} bytes ({} hot, {} cold), prolog {} bytes",
        method.name, out.code_size, out.hot_size, out.cold_size, out.prolog_size
    );
    print!("{}", method.groups);
    print_bytes("hot", 0, &out.hot);
    print_bytes("cold", out.hot_size, &out.cold);
    print_bytes("data", 0, &out.data);
    if cli.disasm {
        disassemble(method);
    }
    for reloc in &out.relocations {
        println!(
            "reloc {:?}+{:#x}: {:?} -> {:?} {:+}",
            reloc.section, reloc.offset, reloc.kind, reloc.target, reloc.addend
        );
    }
    for event in &out.unwind_events {
        println!("unwind {:#x}: {:?}", event.offset, event.kind);
    }
    print!("{}", out.gc_info);
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let text = match cli.read_input() {
        Ok(text) => text,
        Err(e) => {
            eprintln!("igemit: cannot read input: {e}");
            return ExitCode::FAILURE;
        }
    };

    let arena = Bump::new();
    let config = cli.config();
    let session = CompilationSession::with_limit(&arena, config.arena_limit);
    let method = match emit_text(&session, &text, config) {
        Ok(method) => method,
        Err(e) => {
            eprintln!("igemit: {e}");
            return ExitCode::FAILURE;
        }
    };
    report(&cli, &method);

    if let Some(path) = &cli.elf {
        let written = write_object(&method.name, &method.output)
            .map_err(|e| e.to_string())
            .and_then(|bytes| fs::write(path, bytes).map_err(|e| e.to_string()));
        if let Err(e) = written {
            eprintln!("igemit: cannot write {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
        log::info!("wrote {}", path.display());
    }
    if cli.stats {
        print!("{}", session.stats());
    }
    ExitCode::SUCCESS
}
