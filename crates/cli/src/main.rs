//! Metrics Query CLI
//!
//! A command-line tool for browsing the cluster catalog and running
//! snapshot, series and summary queries against the query service.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use commands::{catalog, query, summary};
use output::{print_error, print_info, print_success, OutputFormat};

const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Metrics Query CLI
#[derive(Parser)]
#[command(name = "mq")]
#[command(author, version, about = "CLI for the Metrics Query Service", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via MQ_API_URL env var or the config file)
    #[arg(long, env = "MQ_API_URL")]
    pub api_url: Option<String>,

    /// Output format (defaults to the config file setting, then table)
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List clusters
    Clusters,

    /// List nodes, grouped by cluster
    Nodes {
        /// Only nodes of this cluster
        #[arg(long, short)]
        cluster: Option<String>,
    },

    /// List agents, grouped by cluster
    Agents {
        /// Only agents of this cluster
        #[arg(long, short)]
        cluster: Option<String>,
    },

    /// List the metric name catalog
    MetricNames,

    /// Show ingest status
    Status,

    /// Check that the service and its store are reachable
    Health,

    /// List open incidents, newest first
    Incidents,

    /// Latest value of each series
    Snapshot {
        #[command(flatten)]
        options: QueryArgs,

        #[command(subcommand)]
        target: query::Target,
    },

    /// Bucketed series over a date range
    Series {
        #[command(flatten)]
        options: QueryArgs,

        /// Range start, e.g. "2024-01-01 00:00:00" or RFC 3339
        #[arg(long)]
        from: String,

        /// Range end (exclusive)
        #[arg(long)]
        to: String,

        /// Bucket unit: minute, hour, day, month or year (automatic if omitted)
        #[arg(long, short)]
        granularity: Option<String>,

        #[command(subcommand)]
        target: query::Target,
    },

    /// Latest-value rollups
    #[command(subcommand)]
    Summary(SummaryCommands),

    /// Show or update the CLI config file
    Config {
        /// Store this API URL as the default
        #[arg(long)]
        set_api_url: Option<String>,

        /// Store this timezone as the default
        #[arg(long)]
        set_timezone: Option<String>,

        /// Store this output format as the default
        #[arg(long)]
        set_format: Option<OutputFormat>,
    },
}

/// Options shared by snapshot and series queries
#[derive(Args)]
pub struct QueryArgs {
    /// Metric name to include; repeat for several
    #[arg(long = "metric", short = 'm')]
    pub metrics: Vec<String>,

    /// IANA timezone for buckets and naive range bounds
    #[arg(long, short)]
    pub timezone: Option<String>,
}

#[derive(Subcommand)]
pub enum SummaryCommands {
    /// Per-cluster rollup
    Clusters {
        /// Only this cluster
        cluster: Option<String>,
    },

    /// Per-node rollup of a cluster
    Nodes {
        cluster: String,

        /// Only this node
        #[arg(long)]
        node: Option<String>,
    },
}

fn format_name(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Table => "table",
        OutputFormat::Json => "json",
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

/// Print the config file, or update it when any setter is given
fn configure(
    mut settings: config::Config,
    api_url: Option<String>,
    timezone: Option<String>,
    format: Option<OutputFormat>,
) -> Result<()> {
    if api_url.is_none() && timezone.is_none() && format.is_none() {
        return output::print_json(&settings);
    }
    if let Some(url) = api_url {
        url::Url::parse(&url).map_err(|e| anyhow::anyhow!("Invalid API URL {}: {}", url, e))?;
        settings.api_url = Some(url);
    }
    if let Some(tz) = timezone {
        settings.default_timezone = Some(tz);
    }
    if let Some(format) = format {
        settings.default_format = Some(format_name(format).to_string());
    }
    let path = settings.save()?;
    print_success(&format!("Saved {}", path.display()));
    Ok(())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::Config::load()?;

    let command = match cli.command {
        Commands::Config {
            set_api_url,
            set_timezone,
            set_format,
        } => return configure(settings, set_api_url, set_timezone, set_format),
        command => command,
    };

    let api_url = cli
        .api_url
        .or_else(|| settings.api_url.clone())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let format = cli
        .format
        .or_else(|| settings.default_format.as_deref().and_then(OutputFormat::from_name))
        .unwrap_or_default();

    // Initialize client
    let client = client::ApiClient::new(&api_url)?;

    let query_options = |options: QueryArgs| query::QueryOptions {
        metrics: options.metrics,
        timezone: options.timezone.or_else(|| settings.default_timezone.clone()),
        ..Default::default()
    };

    // Execute command
    match command {
        Commands::Clusters => catalog::list_clusters(&client, format).await?,
        Commands::Nodes { cluster } => catalog::list_nodes(&client, cluster.as_deref(), format).await?,
        Commands::Agents { cluster } => catalog::list_agents(&client, cluster.as_deref(), format).await?,
        Commands::MetricNames => catalog::list_metric_names(&client, format).await?,
        Commands::Status => catalog::show_status(&client, format).await?,
        Commands::Health => catalog::check_health(&client, format).await?,
        Commands::Incidents => catalog::list_incidents(&client, format).await?,
        Commands::Snapshot { options, target } => {
            query::snapshot(&client, &target, &query_options(options), format).await?;
        }
        Commands::Series {
            options,
            from,
            to,
            granularity,
            target,
        } => {
            if format == OutputFormat::Table {
                print_info(&format!("Querying {} .. {}", from, to));
            }
            let options = query::QueryOptions {
                from: Some(from),
                to: Some(to),
                granularity,
                ..query_options(options)
            };
            query::series(&client, &target, &options, format).await?;
        }
        Commands::Summary(summary_cmd) => match summary_cmd {
            SummaryCommands::Clusters { cluster } => {
                summary::show_rollup(&client, &summary::clusters_path(cluster.as_deref()), format).await?;
            }
            SummaryCommands::Nodes { cluster, node } => {
                summary::show_rollup(&client, &summary::nodes_path(&cluster, node.as_deref()), format).await?;
            }
        },
        // Handled before the client is built
        Commands::Config { .. } => {}
    }

    Ok(())
}
