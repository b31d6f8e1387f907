use clap::ArgAction;
use clap::Parser;
use icmptrace::DEFAULT_ATTEMPTS_PER_HOP;
use icmptrace::DEFAULT_IDENTIFIER;
use icmptrace::DEFAULT_MAX_HOPS;
use icmptrace::HopSink;
use icmptrace::JsonOutput;
use icmptrace::RawIcmpFactory;
use icmptrace::ReplyMatch;
use icmptrace::TableOutput;
use icmptrace::Tee;
use icmptrace::TextOutput;
use icmptrace::TraceConfig;
use icmptrace::TraceError;
use icmptrace::TraceOutcome;
use icmptrace::TraceSession;
use icmptrace::resolve_target;
use icmptrace::run_trace;
use std::io;
use std::process::ExitCode;
use std::time::Duration;
use tracing::Level;
use tracing::debug;

/// Trace the IPv4 route to a host with TTL limited ICMP echo requests.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Hostname or IPv4 address to trace
    target: String,

    /// Maximum number of hops to probe
    #[arg(short, long, default_value_t = DEFAULT_MAX_HOPS)]
    max_hops: u8,

    /// Seconds to wait for each reply
    #[arg(short, long, default_value_t = 1.0)]
    wait: f64,

    /// Probes sent per hop
    #[arg(short, long, default_value_t = DEFAULT_ATTEMPTS_PER_HOP)]
    queries: u8,

    /// ICMP identifier stamped on every probe
    #[arg(long, default_value_t = DEFAULT_IDENTIFIER)]
    identifier: u16,

    /// Only accept replies that carry our identifier and sequence
    #[arg(long)]
    strict: bool,

    /// Show the reverse DNS name of each responder
    #[arg(short, long)]
    resolve: bool,

    /// Print newline delimited JSON instead of text
    #[arg(long)]
    json: bool,

    /// Print a summary table when the trace ends
    #[arg(long)]
    table: bool,

    /// More log output on stderr, repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> Result<TraceConfig, TraceError> {
        let timeout = match Duration::try_from_secs_f64(self.wait) {
            Ok(t) => t,
            Err(e) => {
                return Err(TraceError::InvalidConfig {
                    msg: format!("wait {}: {}", self.wait, e),
                });
            }
        };
        let reply_match = if self.strict {
            ReplyMatch::Strict
        } else {
            ReplyMatch::FirstDatagram
        };
        let config = TraceConfig {
            max_hops: self.max_hops,
            timeout,
            attempts_per_hop: self.queries,
            identifier: self.identifier,
            reply_match,
            resolve_names: self.resolve,
        };
        config.validate()?;
        Ok(config)
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_with<S: HopSink>(session: &mut TraceSession, sink: &mut S) -> Result<TraceOutcome, TraceError> {
    let mut factory = RawIcmpFactory::new();
    run_trace(&mut factory, session, sink)
}

fn run(args: &Args) -> Result<TraceOutcome, TraceError> {
    let config = args.config()?;
    let destination = resolve_target(&args.target)?;
    debug!("{} -> {}", args.target, destination);
    let mut session = TraceSession::new(destination, config);

    if args.table {
        let outcome = if args.json {
            let mut sink = Tee::new(JsonOutput::new(io::stdout()), TableOutput::new());
            let outcome = run_with(&mut session, &mut sink)?;
            eprintln!("{}", sink.second);
            outcome
        } else {
            let mut sink = Tee::new(TextOutput::new(io::stdout()), TableOutput::new());
            let outcome = run_with(&mut session, &mut sink)?;
            println!("{}", sink.second);
            outcome
        };
        Ok(outcome)
    } else if args.json {
        run_with(&mut session, &mut JsonOutput::new(io::stdout()))
    } else {
        run_with(&mut session, &mut TextOutput::new(io::stdout()))
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);
    match run(&args) {
        Ok(outcome) => {
            debug!("{}", outcome);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
