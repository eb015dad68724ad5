//! CLI front end. Reads an ESTree JSON tree — the parser itself is out of
//! scope, so this binary accepts the *parser's output* directly — compiles
//! it, and writes the assembled `.wasm`. All user-facing printing lives
//! here; the library stages themselves only return `Result`s.

use std::path::{Path, PathBuf};
use std::{env, fs};

use colour::{e_red_ln, green_ln_bold, grey_ln, red_ln};

use scriptwasm::ast::Program;
use scriptwasm::compiler::compile;
use scriptwasm::config::{CompilerOptions, ValueType};

enum Command {
    Compile { input: PathBuf, output: PathBuf },
    Inspect { input: PathBuf },
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_help();
        std::process::exit(1);
    }

    let detailed_timers = args.iter().any(|a| a == "--detailed-timers");
    let options = match parse_options(&args) {
        Ok(o) => o,
        Err(e) => {
            red_ln!("{}", e);
            std::process::exit(1);
        }
    };

    let command = match parse_command(&args[1..]) {
        Ok(c) => c,
        Err(e) => {
            red_ln!("{}", e);
            print_help();
            std::process::exit(1);
        }
    };

    match command {
        Command::Compile { input, output } => run_compile(&input, &output, &options, detailed_timers),
        Command::Inspect { input } => run_inspect(&input),
    }
}

fn run_compile(input: &Path, output: &Path, options: &CompilerOptions, detailed_timers: bool) {
    let source = match fs::read_to_string(input) {
        Ok(s) => s,
        Err(e) => {
            e_red_ln!("could not read {}: {}", input.display(), e);
            std::process::exit(1);
        }
    };

    let program: Program = match serde_json::from_str(&source) {
        Ok(p) => p,
        Err(e) => {
            e_red_ln!("{}: invalid ESTree JSON: {}", input.display(), e);
            std::process::exit(1);
        }
    };

    match compile(&program, options) {
        Ok(out) => {
            if let Err(e) = fs::write(output, &out.wasm) {
                e_red_ln!("could not write {}: {}", output.display(), e);
                std::process::exit(1);
            }
            grey_ln!("------------------------------------");
            green_ln_bold!("compiled {} -> {}", input.display(), output.display());
            println!("{} bytes", out.wasm.len());
            if detailed_timers {
                grey_ln!(
                    "analyze {:?}  generate {:?}  optimize {:?}  assemble {:?}  total {:?}",
                    out.timings.analyze,
                    out.timings.generate,
                    out.timings.optimize,
                    out.timings.assemble,
                    out.timings.total(),
                );
                grey_ln!(
                    "optimizer: {} -> {} instructions ({:.1}% reduction, {} rewrites)",
                    out.optimizer_stats.instructions_before,
                    out.optimizer_stats.instructions_after,
                    out.optimizer_stats.reduction_percentage(),
                    out.optimizer_stats.rewrites_applied,
                );
            }
        }
        Err(e) => {
            e_red_ln!("compilation failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// `inspect <out.wasm>`: round-trips the binary through `wasmparser` and
/// prints per-section sizes.
fn run_inspect(input: &Path) {
    let bytes = match fs::read(input) {
        Ok(b) => b,
        Err(e) => {
            e_red_ln!("could not read {}: {}", input.display(), e);
            std::process::exit(1);
        }
    };

    let parser = wasmparser::Parser::new(0);
    green_ln_bold!("{}", input.display());
    for payload in parser.parse_all(&bytes) {
        match payload {
            Ok(payload) => println!("{:?}", section_name(&payload)),
            Err(e) => {
                e_red_ln!("invalid wasm module: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn section_name(payload: &wasmparser::Payload) -> &'static str {
    use wasmparser::Payload::*;
    match payload {
        Version { .. } => "header",
        TypeSection(_) => "type",
        ImportSection(_) => "import",
        FunctionSection(_) => "function",
        TableSection(_) => "table",
        MemorySection(_) => "memory",
        TagSection(_) => "tag",
        GlobalSection(_) => "global",
        ExportSection(_) => "export",
        StartSection { .. } => "start",
        ElementSection(_) => "element",
        DataCountSection { .. } => "data-count",
        CodeSectionStart { .. } => "code",
        CodeSectionEntry(_) => "code-entry",
        DataSection(_) => "data",
        CustomSection(_) => "custom",
        End(_) => "end",
        _ => "other",
    }
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    match args.first().map(String::as_str) {
        Some("compile") => {
            let input = args.get(1).ok_or("compile requires an input path")?;
            let output = output_flag(args).unwrap_or_else(|| default_output(input));
            Ok(Command::Compile { input: PathBuf::from(input), output })
        }
        Some("inspect") => {
            let input = args.get(1).ok_or("inspect requires a .wasm path")?;
            Ok(Command::Inspect { input: PathBuf::from(input) })
        }
        Some(other) => Err(format!("unknown command '{other}'")),
        None => Err("no command given".to_string()),
    }
}

fn output_flag(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == "-o" || a == "--output")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn default_output(input: &str) -> PathBuf {
    let mut p = PathBuf::from(input);
    p.set_extension("wasm");
    p
}

/// Maps configuration options to CLI flags, falling back to
/// `--config <file.toml>` and finally [`CompilerOptions::default`].
fn parse_options(args: &[String]) -> Result<CompilerOptions, String> {
    let mut options = if let Some(path) = string_flag(args, "--config") {
        let contents = fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
        CompilerOptions::from_toml_str(&contents).map_err(|e| e.to_string())?
    } else {
        CompilerOptions::default()
    };

    if let Some(vt) = string_flag(args, "--value-type") {
        options.value_type = match vt.as_str() {
            "f64" => ValueType::F64,
            "i32" => ValueType::I32,
            other => return Err(format!("unknown --value-type '{other}' (expected f64 or i32)")),
        };
    }
    if let Some(pages) = string_flag(args, "--page-size") {
        options.page_size_bytes = pages.parse().map_err(|_| "--page-size must be an integer")?;
    }
    if let Some(passes) = string_flag(args, "--opt-passes") {
        options.opt_passes = passes.parse().map_err(|_| "--opt-passes must be an integer")?;
    }
    if args.iter().any(|a| a == "--no-closures") {
        options.closures_enabled = false;
    }
    if args.iter().any(|a| a == "--tail-call") {
        options.tail_call = true;
    }

    Ok(options)
}

fn string_flag(args: &[String], name: &str) -> Option<String> {
    args.iter().position(|a| a == name).and_then(|i| args.get(i + 1)).cloned()
}

fn print_help() {
    grey_ln!("------------------------------------");
    green_ln_bold!("scriptwasmc");
    println!("Usage:");
    println!("  scriptwasmc compile <ast.json> [-o out.wasm] [options]");
    println!("  scriptwasmc inspect <out.wasm>");
    println!();
    green_ln_bold!("Options:");
    println!("  --config <file.toml>   load options from a TOML config file");
    println!("  --value-type <f64|i32> primary scalar of the module (default f64)");
    println!("  --page-size <bytes>    linear-memory page granularity (default 65536)");
    println!("  --opt-passes <n>       peephole optimizer iterations (default 2)");
    println!("  --no-closures          disable capture analysis in the semantic analyzer");
    println!("  --tail-call            enable the call+return -> return_call rewrite");
    println!("  --detailed-timers      print per-stage timing and optimizer stats");
}
