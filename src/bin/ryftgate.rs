use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use tracing::error;
use ryftgate::core::config::Config;
use ryftgate::core::error::{Error, Result};
use ryftgate::core::logging;
use ryftgate::query::{Mode, Optimizer, Options, parse_query_opt};
use ryftgate::search::SearchEvent;
use ryftgate::search::aggs::Aggregations;
use ryftgate::search::backend::RyftprimBackend;
use ryftgate::search::federation::Coordinator;
use ryftgate::search::scheduler::{Scheduler, SearchRequest};
use ryftgate::storage::view::ViewReader;

/// Search gateway: query parsing, backend execution and federation
#[derive(Parser, Debug)]
#[command(name = "ryftgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level, RUST_LOG overrides it
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the parsed and optimized query tree
    Parse {
        query: String,

        /// Max fused boolean operators, -1 for no limit
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        combine_limit: i32,
    },

    /// Dump a VIEW file
    View {
        file: PathBuf,
    },

    /// Run a search and print events as JSON lines
    Search {
        #[arg(long)]
        query: String,

        #[arg(long = "file", required = true)]
        files: Vec<String>,

        /// Surrounding width, -1 for the whole line
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        width: i32,

        #[arg(long)]
        mode: Option<String>,

        #[arg(long, default_value_t = 0)]
        dist: u32,

        /// Case insensitive search
        #[arg(short = 'i', long)]
        ignore_case: bool,

        #[arg(long, default_value_t = 0)]
        limit: u64,

        #[arg(long, default_value = "")]
        delimiter: String,

        #[arg(long, default_value = "")]
        keep_data: String,

        #[arg(long, default_value = "")]
        keep_index: String,

        #[arg(long, default_value = "")]
        keep_view: String,

        /// Post-processing rule: match("re"), replace("re", "tmpl") or
        /// script(name, args..), applied in order
        #[arg(long = "transform")]
        transforms: Vec<String>,

        /// Aggregations as JSON, e.g. '{"avg_x": {"avg": {"field": "x"}}}'
        #[arg(long)]
        aggs: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Parse { query, combine_limit } => {
            let q = parse_query_opt(&query, Options::default())?;
            println!("parsed:    {}", q);
            let q = Optimizer::new(combine_limit, config.optimizer.except_modes.clone()).process(q);
            println!("optimized: {}", q);
            println!("backend:   {}", q.to_old_string());
            Ok(true)
        }

        Command::View { file } => {
            let mut view = ViewReader::open(&file)?;
            println!("items: {}, index: {} bytes, data: {} bytes", view.count(), view.index_len(), view.data_len());
            for pos in 0..view.count() {
                let item = view.get(pos)?;
                println!(
                    "{}: index [{}..{}) data [{}..{})",
                    pos, item.index_beg, item.index_end, item.data_beg, item.data_end
                );
            }
            Ok(true)
        }

        Command::Search {
            query, files, width, mode, dist, ignore_case, limit, delimiter, keep_data, keep_index, keep_view,
            transforms, aggs,
        } => {
            let mut options = Options::default();
            options.width = width;
            options.dist = dist;
            options.case = !ignore_case;
            if let Some(mode) = mode {
                options.set_mode(mode.parse::<Mode>()?);
            }

            let aggregations = match aggs {
                Some(text) => serde_json::from_str(&text)
                    .map_err(|e| Error::option(format!("bad aggregations: {}", e)))?,
                None => serde_json::Value::Null,
            };
            let report = Aggregations::parse(&aggregations)?;

            config.prepare_instance_dir()?;
            let config = Arc::new(config);
            let backend = RyftprimBackend::new(config.backend.tweaks.clone(), config.local_host.clone());
            let scheduler = Arc::new(Scheduler::new(config.clone(), Arc::new(backend))?);
            let directory = Arc::new(config.federation.directory.clone());
            let coordinator = Arc::new(Coordinator::new(config.clone(), directory, scheduler)?);

            let req = SearchRequest {
                query,
                files,
                options,
                delimiter,
                limit,
                keep_data_as: keep_data,
                keep_index_as: keep_index,
                keep_view_as: keep_view,
                transforms,
                aggregations,
                ..SearchRequest::default()
            };

            let mut ok = true;
            for event in coordinator.search(req) {
                match &event {
                    SearchEvent::Error(_) => ok = false,
                    SearchEvent::Stat(stat) => {
                        if let Some(report) = &report {
                            println!("{}", serde_json::json!({ "aggregations": report.render(&stat.aggregations) }));
                        }
                    }
                    SearchEvent::Record(_) => {}
                }
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(ok)
        }
    }
}
