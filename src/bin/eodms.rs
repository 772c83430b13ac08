use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use miette::IntoDiagnostic;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use eodms_client::app::{Eodms, ProgressEvent, ProgressSink};
use eodms_client::auth::{AuthSession, CredentialPrompt, Credentials};
use eodms_client::cancel::CancelToken;
use eodms_client::config::{ClientConfig, ConfigLoader, CredentialLookup, resolve_credentials};
use eodms_client::domain::{Collection, Outcome, Priority, RecordId};
use eodms_client::download::{DownloadReport, DownloadTarget};
use eodms_client::error::EodmsError;
use eodms_client::geometry::SearchGeometry;
use eodms_client::order::OrderSubmitResult;
use eodms_client::output::{JsonOutput, OutputMode};
use eodms_client::params::SearchParameters;
use eodms_client::transport::HttpTransport;

#[derive(Parser)]
#[command(name = "eodms")]
#[command(about = "Search, order and download imagery from EODMS")]
#[command(version, author)]
struct Cli {
    /// Print JSON results and never prompt for credentials.
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON settings file (default: ./eodms.json if present).
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(short, long, global = true)]
    username: Option<String>,

    #[arg(short, long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search a collection; optionally dump, order and download the results")]
    Search(SearchArgs),
    #[command(about = "Order records by id")]
    Order(OrderArgs),
    #[command(about = "Download the items of existing orders")]
    Download(DownloadArgs),
}

#[derive(Args)]
struct SearchArgs {
    /// Collection id or alias (RCM, RS1, RS2, PlanetScope, NAPL).
    #[arg(short, long)]
    collection: Collection,

    /// Start of the time window: TODAY, TODAY-N, a date or a timestamp.
    #[arg(short, long)]
    start: Option<String>,

    /// End of the time window (default: now).
    #[arg(short, long)]
    end: Option<String>,

    /// GeoJSON file with the area of interest.
    #[arg(short, long)]
    geometry: Option<PathBuf>,

    /// Field filter as option=value[,value...]; repeatable.
    #[arg(short, long = "filter", value_name = "OPTION=VALUES")]
    filters: Vec<String>,

    /// Write the results as GeoJSON.
    #[arg(long)]
    dump: Option<Utf8PathBuf>,

    /// Order every record found.
    #[arg(long)]
    submit_order: bool,

    #[arg(long, value_enum, default_value_t = Priority::Medium)]
    priority: Priority,

    /// Wait for the submitted orders and download them.
    #[arg(long, requires = "submit_order")]
    download: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct OrderArgs {
    #[arg(short, long)]
    collection: Collection,

    #[arg(required = true, value_delimiter = ',')]
    record_ids: Vec<RecordId>,

    #[arg(long, value_enum, default_value_t = Priority::Medium)]
    priority: Priority,

    /// Wait for the orders and download them.
    #[arg(long)]
    download: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct DownloadArgs {
    /// Order ids, or item:ID for single items.
    #[arg(required = true, value_delimiter = ',')]
    targets: Vec<DownloadTarget>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct OutputArgs {
    /// Directory for downloaded files.
    #[arg(short, long, default_value = ".")]
    output: Utf8PathBuf,

    #[arg(long)]
    max_workers: Option<usize>,

    /// Download again even when a complete local copy exists.
    #[arg(long)]
    overwrite: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(Outcome::Succeeded) => ExitCode::SUCCESS,
        Ok(Outcome::PartiallySucceeded) => ExitCode::from(5),
        Ok(Outcome::Failed) => ExitCode::from(1),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<EodmsError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &EodmsError) -> u8 {
    match error {
        EodmsError::Validation { .. }
        | EodmsError::InvalidCollection(_)
        | EodmsError::InvalidId(_)
        | EodmsError::InvalidInput(_)
        | EodmsError::Geometry(_)
        | EodmsError::ConfigRead(_)
        | EodmsError::ConfigParse(_) => 2,
        EodmsError::TransientService { .. }
        | EodmsError::Status { .. }
        | EodmsError::Network(_)
        | EodmsError::Decode(_) => 3,
        EodmsError::Auth(_) | EodmsError::MissingCredentials(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<Outcome> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let cancel = CancelToken::new();
    let sink = TracingProgress;

    match cli.command {
        Commands::Search(args) => {
            let mut params = SearchParameters::new();
            if let Some(start) = args.start {
                params = params.with_start(start);
            }
            if let Some(end) = args.end {
                params = params.with_end(end);
            }
            if let Some(path) = &args.geometry {
                let geometry = SearchGeometry::from_file(path)?;
                info!(
                    path = %path.display(),
                    shapes = geometry.shapes().len(),
                    vertices = geometry.vertex_count(),
                    "search geometry loaded"
                );
                params = params.with_geometry(geometry);
            }
            for filter in &args.filters {
                let (option, values) = filter.split_once('=').ok_or_else(|| {
                    EodmsError::InvalidInput(format!("filter `{filter}` is not OPTION=VALUE"))
                })?;
                for value in values.split(',').map(str::trim).filter(|v| !v.is_empty()) {
                    params = params.with_filter(option.trim(), value);
                }
            }

            let mut eodms = connect(&cli.username, &cli.password, &args.output, config, args.collection, output_mode)?;
            let found = eodms.query_collection(args.collection, params, &cancel, &sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_query(found).into_diagnostic()?,
                OutputMode::Interactive => println!(
                    "Found {} {} record(s) ({} skipped)",
                    found.len(),
                    found.collection,
                    found.skipped
                ),
            }
            if let Some(path) = &args.dump {
                eodms.write_results(path)?;
            }
            if !args.submit_order {
                return Ok(Outcome::Succeeded);
            }
            if eodms.results().is_none_or(|r| r.is_empty()) {
                warn!("nothing to order");
                return Ok(Outcome::Succeeded);
            }
            let ordered = eodms.order_results(args.priority, &cancel, &sink)?;
            report_order(ordered, output_mode)?;
            if !args.download {
                return Ok(ordered.outcome());
            }
            let order_outcome = ordered.outcome();
            let report = eodms.download_last_order(&args.output.output, args.output.max_workers, &cancel, &sink)?;
            report_download(&report, output_mode)?;
            Ok(worst(order_outcome, report.outcome()))
        }
        Commands::Order(args) => {
            let mut eodms = connect(&cli.username, &cli.password, &args.output, config, args.collection, output_mode)?;
            let ordered = eodms.order(&args.record_ids, args.priority, &cancel, &sink)?;
            report_order(ordered, output_mode)?;
            let order_outcome = ordered.outcome();
            if !args.download {
                return Ok(order_outcome);
            }
            let report = eodms.download_last_order(&args.output.output, args.output.max_workers, &cancel, &sink)?;
            report_download(&report, output_mode)?;
            Ok(worst(order_outcome, report.outcome()))
        }
        Commands::Download(args) => {
            let eodms = connect(&cli.username, &cli.password, &args.output, config, Collection::Rcm, output_mode)?;
            let report = eodms.download(&args.targets, &args.output.output, args.output.max_workers, &cancel, &sink)?;
            report_download(&report, output_mode)?;
            Ok(report.outcome())
        }
    }
}

fn connect(
    username: &Option<String>,
    password: &Option<String>,
    output: &OutputArgs,
    mut config: ClientConfig,
    collection: Collection,
    output_mode: OutputMode,
) -> miette::Result<Eodms<HttpTransport>> {
    if output.overwrite {
        config.download.overwrite = true;
    }
    let interactive = matches!(output_mode, OutputMode::Interactive);
    let credentials = match resolve_credentials(username.as_deref(), password.as_deref(), &config.netrc_host) {
        CredentialLookup::Complete(credentials) => credentials,
        CredentialLookup::Partial { username, password } if interactive => {
            TerminalPrompt.complete(username, password)?
        }
        CredentialLookup::Partial { .. } => {
            return Err(EodmsError::MissingCredentials(
                "pass --username/--password, set EODMS_USERNAME/EODMS_PASSWORD or add a netrc entry"
                    .to_string(),
            )
            .into());
        }
    };

    let transport = HttpTransport::new(&config.base_url, config.timeout)?;
    let mut session = AuthSession::new(transport, credentials).with_retry(config.retry);
    if interactive {
        session = session.with_prompt(Box::new(TerminalPrompt));
    }
    Ok(Eodms::new(session, config, collection))
}

fn worst(a: Outcome, b: Outcome) -> Outcome {
    match (a, b) {
        (Outcome::Succeeded, Outcome::Succeeded) => Outcome::Succeeded,
        (Outcome::Failed, Outcome::Failed) => Outcome::Failed,
        _ => Outcome::PartiallySucceeded,
    }
}

fn report_order(result: &OrderSubmitResult, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_order(result).into_diagnostic(),
        OutputMode::Interactive => {
            let green = "\x1b[32m";
            let red = "\x1b[31m";
            let reset = "\x1b[0m";
            println!("{green}Orders submitted: {}{reset}", result.order_ids.len());
            for id in &result.order_ids {
                println!("{green}  order {id}{reset}");
            }
            for failure in &result.failures {
                println!(
                    "{red}  batch {} ({} records) failed: {}{reset}",
                    failure.batch + 1,
                    failure.record_ids.len(),
                    failure.error
                );
            }
            Ok(())
        }
    }
}

fn report_download(report: &DownloadReport, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_download(report).into_diagnostic(),
        OutputMode::Interactive => {
            let green = "\x1b[32m";
            let yellow = "\x1b[33m";
            let red = "\x1b[31m";
            let reset = "\x1b[0m";
            println!(
                "{green}Downloaded: {}{reset}  {red}Failed: {}{reset}",
                report.succeeded(),
                report.failed()
            );
            for (item, outcome) in &report.items {
                match outcome.path() {
                    Some(path) => println!("{green}  item {item}: {path}{reset}"),
                    None => println!("{yellow}  item {item}: {outcome:?}{reset}"),
                }
            }
            for unresolved in &report.unresolved {
                println!("{red}  {}: {}{reset}", unresolved.target, unresolved.error);
            }
            Ok(())
        }
    }
}

struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::PageFetched { fetched, total } => info!("fetched {fetched} of {total} records"),
            ProgressEvent::MetadataFetched { fetched, total } => {
                debug!("fetched metadata for {fetched} of {total} records")
            }
            ProgressEvent::BatchSubmitted { batch, order_ids } => {
                info!(batch = batch + 1, ?order_ids, "order batch submitted")
            }
            ProgressEvent::BatchFailed { batch, error } => warn!(batch = batch + 1, %error, "order batch failed"),
            ProgressEvent::ItemStatus { item_id, status } => info!(item = %item_id, %status, "item status"),
            ProgressEvent::TransferStarted { item_id, path, size } => {
                info!(item = %item_id, %path, ?size, "downloading")
            }
            ProgressEvent::TransferFinished { item_id, outcome } if outcome.is_success() => {
                info!(item = %item_id, "item done")
            }
            ProgressEvent::TransferFinished { item_id, outcome } => {
                warn!(item = %item_id, ?outcome, "item failed")
            }
        }
    }
}

/// Reads the username from stdin and the password with echo off.
struct TerminalPrompt;

impl TerminalPrompt {
    fn complete(
        &self,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Credentials, EodmsError> {
        let username = match username {
            Some(username) => username,
            None => read_line("EODMS username: ")?,
        };
        let password = match password {
            Some(password) => password,
            None => read_password("EODMS password: ")?,
        };
        Ok(Credentials::new(username, password))
    }
}

impl CredentialPrompt for TerminalPrompt {
    fn prompt(&self, username: Option<&str>) -> Result<Credentials, EodmsError> {
        eprintln!("EODMS rejected the credentials; try again.");
        let username = match username {
            Some(current) => {
                let entered = read_line(&format!("EODMS username [{current}]: "))?;
                if entered.is_empty() {
                    current.to_string()
                } else {
                    entered
                }
            }
            None => read_line("EODMS username: ")?,
        };
        self.complete(Some(username), None)
    }
}

fn prompt_error(err: io::Error) -> EodmsError {
    EodmsError::MissingCredentials(format!("cannot read from the terminal: {err}"))
}

fn read_line(label: &str) -> Result<String, EodmsError> {
    eprint!("{label}");
    io::stderr().flush().map_err(prompt_error)?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).map_err(prompt_error)?;
    Ok(line.trim().to_string())
}

fn read_password(label: &str) -> Result<String, EodmsError> {
    eprint!("{label}");
    io::stderr().flush().map_err(prompt_error)?;
    enable_raw_mode().map_err(prompt_error)?;
    let result = read_hidden();
    disable_raw_mode().map_err(prompt_error)?;
    eprintln!();
    result
}

fn read_hidden() -> Result<String, EodmsError> {
    let mut password = String::new();
    loop {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            ..
        }) = event::read().map_err(prompt_error)?
        else {
            continue;
        };
        match code {
            KeyCode::Enter => return Ok(password),
            KeyCode::Backspace => {
                password.pop();
            }
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(EodmsError::MissingCredentials("password entry aborted".to_string()));
            }
            KeyCode::Esc => {
                return Err(EodmsError::MissingCredentials("password entry aborted".to_string()));
            }
            KeyCode::Char(c) => password.push(c),
            _ => {}
        }
    }
}
