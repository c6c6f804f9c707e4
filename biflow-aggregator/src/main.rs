//! The aggregator binary: option parsing, transport wiring, and the
//! termination protocol around the engine loop.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use getopts::Options;
use tracing::error;

use biflow_aggregator::config::{self, FlushSchedule, Settings};
use biflow_aggregator::engine::Engine;
use biflow_aggregator::transport::{FramedInput, FramedOutput};

/// Grace period between a termination signal and a hard exit, should the
/// shutdown flush stall on the sink.
const KILL_AFTER: Duration = Duration::from_secs(3);

fn options() -> Options {
    let mut opts = Options::new();
    opts.reqopt("c", "config", "Configuration file in xml format.", "filename");
    opts.reqopt("n", "name", "Name of config section.", "name");
    opts.reqopt("i", "input", "Input stream: unix:PATH, tcp:HOST:PORT, file:PATH or '-'.", "spec");
    opts.reqopt("o", "output", "Output stream: unix:PATH, tcp:HOST:PORT, file:PATH or '-'.", "spec");
    opts.optflag("e", "eof", "End when receive EOF.");
    opts.optopt("s", "size", "Max number of elements in flow cache, as a bit width.", "number");
    opts.optopt("a", "active-timeout", "Active timeout in seconds.", "number");
    opts.optopt("p", "passive-timeout", "Passive timeout in seconds.", "number");
    opts.optopt("g", "global-timeout", "Global flush interval, with optional a|r suffix.", "spec");
    opts.optopt("t", "recv-timeout", "Receive timeout in milliseconds.", "number");
    opts.optflag("v", "verbose", "Verbose logging.");
    opts.optflag("h", "help", "Print this help.");
    opts
}

fn usage(opts: &Options) -> String {
    opts.usage(
        "Aggregates flow records by a configured key with per-field aggregation \
         functions, emitting one merged record per flow when a timeout expires \
         or the cache evicts.\n\n\
         Usage: biflow-aggregator -i INPUT -o OUTPUT -c CONFIG -n SECTION [options]",
    )
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
    File(File),
    StdIn,
    StdOut,
}

/// Parses `unix:PATH`, `tcp:HOST:PORT`, `file:PATH` or `-` and connects.
fn open_stream(spec: &str, timeout: Option<Duration>) -> io::Result<Stream> {
    if spec == "-" {
        return Ok(Stream::StdIn);
    }
    match spec.split_once(':') {
        Some(("unix", path)) => {
            let stream = UnixStream::connect(path)?;
            stream.set_read_timeout(timeout)?;
            Ok(Stream::Unix(stream))
        }
        Some(("tcp", addr)) => {
            let stream = TcpStream::connect(addr)?;
            stream.set_read_timeout(timeout)?;
            Ok(Stream::Tcp(stream))
        }
        Some(("file", path)) => Ok(Stream::File(File::open(path)?)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid stream spec {:?}, expected unix:PATH, tcp:HOST:PORT, file:PATH or '-'", spec),
        )),
    }
}

fn open_sink(spec: &str) -> io::Result<Stream> {
    if spec == "-" {
        return Ok(Stream::StdOut);
    }
    match spec.split_once(':') {
        Some(("unix", path)) => Ok(Stream::Unix(UnixStream::connect(path)?)),
        Some(("tcp", addr)) => Ok(Stream::Tcp(TcpStream::connect(addr)?)),
        Some(("file", path)) => Ok(Stream::File(File::create(path)?)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid stream spec {:?}, expected unix:PATH, tcp:HOST:PORT, file:PATH or '-'", spec),
        )),
    }
}

fn reader(stream: Stream) -> Box<dyn Read> {
    match stream {
        Stream::Unix(stream) => Box::new(stream),
        Stream::Tcp(stream) => Box::new(stream),
        Stream::File(file) => Box::new(BufReader::new(file)),
        Stream::StdIn => Box::new(io::stdin()),
        Stream::StdOut => unreachable!("stdout is not readable"),
    }
}

fn writer(stream: Stream) -> Box<dyn Write> {
    match stream {
        Stream::Unix(stream) => Box::new(BufWriter::new(stream)),
        Stream::Tcp(stream) => Box::new(BufWriter::new(stream)),
        Stream::File(file) => Box::new(BufWriter::new(file)),
        Stream::StdOut => Box::new(io::stdout()),
        Stream::StdIn => unreachable!("stdin is not writable"),
    }
}

fn parse_number(matches: &getopts::Matches, opt: &str) -> Result<Option<u64>, String> {
    match matches.opt_str(opt) {
        Some(text) => text
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("option -{} expects a number, got {:?}", opt, text)),
        None => Ok(None),
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = options();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        println!("{}", usage(&opts));
        return Ok(());
    }
    let matches = opts.parse(&args).map_err(|err| err.to_string())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if matches.opt_present("v") {
                    tracing_subscriber::EnvFilter::new("debug")
                } else {
                    tracing_subscriber::EnvFilter::new("info")
                }
            }),
        )
        .with_writer(io::stderr)
        .init();

    let mut settings = Settings { eof_terminates: matches.opt_present("e"), ..Settings::default() };
    if let Some(bits) = parse_number(&matches, "s")? {
        settings.set_cache_bits(bits as u32);
    }
    if let Some(active) = parse_number(&matches, "a")? {
        settings.active_secs = active;
    }
    if let Some(passive) = parse_number(&matches, "p")? {
        settings.passive_secs = passive;
    }
    if let Some(spec) = matches.opt_str("g") {
        settings.flush = Some(FlushSchedule::parse(&spec).map_err(|err| err.to_string())?);
    }
    settings.validate().map_err(|err| err.to_string())?;

    let config_path = matches.opt_str("c").unwrap_or_default();
    let section = matches.opt_str("n").unwrap_or_default();
    let rules = config::load_rules(Path::new(&config_path), &section).map_err(|err| err.to_string())?;

    let recv_timeout = parse_number(&matches, "t")?.unwrap_or(500);
    let input_spec = matches.opt_str("i").unwrap_or_default();
    let output_spec = matches.opt_str("o").unwrap_or_default();
    let input_stream = open_stream(&input_spec, Some(Duration::from_millis(recv_timeout)))
        .map_err(|err| format!("cannot open input {}: {}", input_spec, err))?;
    let output_stream =
        open_sink(&output_spec).map_err(|err| format!("cannot open output {}: {}", output_spec, err))?;

    let stop = Arc::new(AtomicBool::new(false));
    let clean = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let clean = Arc::clone(&clean);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
            // Guarantee forward progress even if the shutdown flush stalls.
            let clean = Arc::clone(&clean);
            std::thread::spawn(move || {
                std::thread::sleep(KILL_AFTER);
                if !clean.load(Ordering::Relaxed) {
                    eprintln!("shutdown flush stalled, exiting");
                    std::process::exit(1);
                }
            });
        })
        .map_err(|err| format!("cannot install signal handler: {}", err))?;
    }

    let mut input = FramedInput::new(reader(input_stream));
    let mut output = FramedOutput::new(writer(output_stream));
    let mut engine = Engine::new(rules, settings);
    let result = engine.run(&mut input, &mut output, &stop);
    clean.store(true, Ordering::Relaxed);
    result.map_err(|err| err.to_string())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}
