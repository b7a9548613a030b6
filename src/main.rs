use std::{env, process::exit};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tramp::runtime::ppc::disasm;
use tramp::{CodeInfo, CodeRegistry, GeneratorBuilder, Method, RuntimeEntryPoints, Signature};

/// Stand-in runtime addresses for thunks built outside a runtime.
const CONVERT_NATIVE_TO_TAGGED: u32 = 0x0000_1000;
const INTERPRETER_ENTRY: u32 = 0x0000_2000;
const METHOD_HANDLE: u32 = 0x0000_3000;

struct Opts {
    /// Whether to print the code.
    print_code: bool,

    /// Whether to print the code as `.byte` directives.
    bytes: bool,

    /// Build a thunk instead of a trampoline.
    thunk: bool,

    /// The callee is a string constructor.
    string_ctor: bool,

    /// Native size rules for thunk argument conversion.
    pinvoke: bool,

    /// The signature to generate code for.
    signature: String,
}

/// Logs registrations instead of recording them.
struct LogRegistry;

impl CodeRegistry for LogRegistry {
    fn register(&self, info: CodeInfo) {
        info!(
            "registered {} bytes at {:p} for method 0x{:08x}",
            info.code_size, info.code_start, info.method
        );
    }
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "usage: tramp [--print-code] [--bytes] [--thunk] [--string-ctor] [--pinvoke] <signature>"
        );
        exit(1);
    }
    let opts = parse_opts(&args);

    if let Err(err) = run(&opts) {
        eprintln!("tramp: {}", err);
        exit(1);
    }
}

fn run(opts: &Opts) -> tramp::Result<()> {
    let sig: Signature = opts.signature.parse()?;
    let sig = sig.pinvoke(opts.pinvoke);

    let generator = GeneratorBuilder::new()
        .print_code(opts.print_code)
        .entry_points(RuntimeEntryPoints {
            convert_native_to_tagged: CONVERT_NATIVE_TO_TAGGED,
            interpreter_entry: INTERPRETER_ENTRY,
        })
        .build();

    let (code, stack_size) = if opts.thunk {
        let method = Method {
            handle: METHOD_HANDLE,
            signature: sig,
        };
        let thunk = generator.create_method_pointer(&method, &LogRegistry)?;
        (thunk.code().to_vec(), thunk.stack_size())
    } else {
        let trampoline = generator.create_trampoline(&sig, opts.string_ctor)?;
        (trampoline.code().to_vec(), trampoline.stack_size())
    };

    if opts.bytes {
        print!("{}", disasm::byte_listing(&code));
    }
    println!("{} bytes of code, {} byte frame", code.len(), stack_size);
    Ok(())
}

fn parse_opts(args: &[String]) -> Opts {
    let mut print_code = false;
    let mut bytes = false;
    let mut thunk = false;
    let mut string_ctor = false;
    let mut pinvoke = false;
    let mut signature = Vec::new();
    let mut i = 1; // Skip program name
    while i < args.len() {
        match args[i].as_str() {
            "--print-code" => print_code = true,
            "--bytes" => bytes = true,
            "--thunk" => thunk = true,
            "--string-ctor" => string_ctor = true,
            "--pinvoke" => pinvoke = true,
            "--" => {
                signature.extend_from_slice(&args[i + 1..]);
                break;
            }
            // The signature may arrive unquoted, split over several arguments.
            arg => signature.push(arg.to_string()),
        }
        i += 1;
    }
    Opts {
        print_code,
        bytes,
        thunk,
        string_ctor,
        pinvoke,
        signature: signature.join(" "),
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
