//! neurograph CLI: inspect and maintain graph files.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;

use neurograph::{
    CancelFlag, Direction, Graph, GraphConfig, NeuronBody, NeuronId, Payload, TypeTag,
};

#[derive(Parser)]
#[command(name = "neurograph", version, about = "Persistent property graph tooling")]
struct Cli {
    /// TOML file with graph settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts and cache settings for a graph file.
    Stats {
        file: PathBuf,
    },

    /// Print one entity.
    Show {
        file: PathBuf,
        /// Entity id, e.g. "42" or "n:42".
        #[arg(value_parser = parse_id)]
        id: NeuronId,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List the links of an entity.
    Links {
        file: PathBuf,
        #[arg(value_parser = parse_id)]
        id: NeuronId,
        /// List links pointing at the entity instead of leaving it.
        #[arg(long)]
        incoming: bool,
    },

    /// Decode every record and report malformed or dangling ones.
    Verify {
        file: PathBuf,
    },

    /// Rewrite a graph file, dropping unreadable records.
    Compact {
        input: PathBuf,
        output: PathBuf,
    },
}

fn parse_id(raw: &str) -> std::result::Result<NeuronId, String> {
    let digits = raw.strip_prefix("n:").unwrap_or(raw);
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid id {raw:?}: {e}"))?;
    NeuronId::new(value)
        .filter(|id| !id.is_temp())
        .ok_or_else(|| format!("invalid id {raw:?}: ids start at 1"))
}

#[derive(Serialize)]
struct ShowJson<'a> {
    id: NeuronId,
    tag: TypeTag,
    #[serde(flatten)]
    body: &'a NeuronBody,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GraphConfig::from_toml_file(path)?,
        None => GraphConfig::default(),
    };

    match cli.command {
        Commands::Stats { file } => {
            let graph = open(config, &file)?;
            print!("{}", graph.info());
        }

        Commands::Show { file, id, json } => {
            let graph = open(config, &file)?;
            let tag = graph.get(id)?.type_tag();
            if json {
                let rendered = graph.peek(id, |body| {
                    serde_json::to_string_pretty(&ShowJson { id, tag, body })
                })?;
                println!("{}", rendered.into_diagnostic()?);
            } else {
                let text = graph.peek(id, |body| describe(id, tag, body))?;
                print!("{text}");
            }
        }

        Commands::Links { file, id, incoming } => {
            let graph = open(config, &file)?;
            let direction = if incoming {
                Direction::In
            } else {
                Direction::Out
            };
            let view = graph.links(id, direction)?;
            let label = if incoming { "incoming" } else { "outgoing" };
            println!("{} {label} link(s) of {id}", view.len());
            for link in view.iter() {
                match view.ends(link) {
                    Some(ends) => println!(
                        "  {link}: {} -> {} (meaning {})",
                        ends.from, ends.to, ends.meaning
                    ),
                    None => println!("  {link}: (not a link)"),
                }
            }
            view.release();
        }

        Commands::Verify { file } => {
            let graph = open(config, &file)?;
            let report = graph.verify(&CancelFlag::new())?;
            print!("{report}");
            if !report.is_clean() {
                miette::bail!(
                    help = "run `neurograph compact` to rewrite the file without unreadable records",
                    "{} has {} malformed and {} dangling record(s)",
                    file.display(),
                    report.malformed.len(),
                    report.dangling.len()
                );
            }
        }

        Commands::Compact { input, output } => {
            let graph = open(config, &input)?;
            // Decoding every record drops the malformed ones before they are copied.
            graph.preload(&CancelFlag::new())?;
            let report = graph.save(&output)?;
            println!(
                "Compacted {} -> {} ({} records)",
                input.display(),
                report.path.display(),
                report.records
            );
        }
    }

    Ok(())
}

fn open(config: GraphConfig, path: &Path) -> Result<Graph> {
    let graph = Graph::new(config)?;
    let report = graph.load(path)?;
    tracing::info!(
        path = %report.path.display(),
        records = report.records,
        skipped = report.skipped,
        "attached graph file"
    );
    Ok(graph)
}

fn join(ids: &[NeuronId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn describe(id: NeuronId, tag: TypeTag, body: &NeuronBody) -> String {
    let mut out = format!("{id} ({tag})\n");
    match body.payload() {
        Payload::Plain => {}
        Payload::Scalar(value) => out.push_str(&format!("  value:        {value:?}\n")),
        Payload::Link(link) => {
            out.push_str(&format!("  from:         {}\n", link.from()));
            out.push_str(&format!("  to:           {}\n", link.to()));
            out.push_str(&format!("  meaning:      {}\n", link.meaning()));
            if !link.info().is_empty() {
                out.push_str(&format!("  info:         {}\n", join(link.info())));
            }
        }
        Payload::Cluster(cluster) => {
            if let Some(meaning) = cluster.meaning() {
                out.push_str(&format!("  meaning:      {meaning}\n"));
            }
            out.push_str(&format!(
                "  children:     [{}]{}\n",
                join(cluster.children()),
                if cluster.is_ordered() { "" } else { " (unordered)" }
            ));
        }
    }
    out.push_str(&format!("  links out:    [{}]\n", join(body.links_out())));
    if !body.clustered_by().is_empty() {
        out.push_str(&format!("  clustered by: [{}]\n", join(body.clustered_by())));
    }
    out
}
