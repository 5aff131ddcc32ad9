use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

use mortgage_intake_lib::config;
use mortgage_intake_lib::export::{self, ExportError};
use mortgage_intake_lib::models::ExtractionPayload;
use mortgage_intake_lib::pipeline::batch_extraction::{ExtractionEvent, ExtractionRunner};
use mortgage_intake_lib::pipeline::documents::{DocumentBundle, DocumentReadError};
use mortgage_intake_lib::pipeline::field_extraction::{
    Attachment, ExtractionError, FieldExtractor, GeminiClient,
};
use mortgage_intake_lib::pipeline_config::ExtractionConfig;
use mortgage_intake_lib::registry::{RegistryCache, RegistryError};

#[derive(Parser, Debug)]
#[command(
    name = "mortgage-intake",
    about = "Extract mortgage application fields from client documents",
    version
)]
struct Cli {
    /// Bank registry CSV (defaults to $MORTGAGE_INTAKE_REGISTRY or registry_store/bank_registry.csv)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the banks present in the registry
    Banks,
    /// Print the required field keys for a bank
    Fields {
        #[arg(long)]
        bank: String,
    },
    /// Run extraction for one or more banks
    Extract(ExtractArgs),
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Bank to extract for (repeatable)
    #[arg(long = "bank", required = true)]
    banks: Vec<String>,
    /// Extracted document text, one file per document (repeatable)
    #[arg(long = "text", required = true)]
    texts: Vec<PathBuf>,
    /// Original document sent to the model alongside the text (repeatable)
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    /// Confidence below which a field is flagged for review
    #[arg(long)]
    threshold: Option<f64>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
    /// Write the export here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Extraction(#[from] ExtractionError),

    #[error("{0}")]
    Export(#[from] ExportError),

    #[error("{0}")]
    Documents(#[from] DocumentReadError),

    #[error("Cannot read {}: {source}", .path.display())]
    Input {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write output: {0}")]
    Output(#[from] std::io::Error),
}

fn main() {
    mortgage_intake_lib::init_tracing();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let registry = Arc::new(RegistryCache::new(
        cli.registry.unwrap_or_else(config::registry_path),
    ));

    match cli.command {
        Command::Banks => {
            for bank in registry.get()?.banks() {
                println!("{bank}");
            }
            Ok(())
        }
        Command::Fields { bank } => {
            for field in registry.get()?.required_fields_for(&bank) {
                println!("{field}");
            }
            Ok(())
        }
        Command::Extract(args) => extract(registry, args),
    }
}

fn extract(registry: Arc<RegistryCache>, args: ExtractArgs) -> Result<(), CliError> {
    let config = ExtractionConfig::from_env();
    let threshold = args.threshold.unwrap_or(config.confidence_threshold_default);

    // Fail fast on a broken registry before any model call.
    registry.get()?;

    let documents = DocumentBundle::from_text_files(args.texts.as_slice())?;
    let attachments = args
        .attachments
        .iter()
        .map(|path| read_attachment(path))
        .collect::<Result<Vec<_>, _>>()?;

    let llm = Arc::new(GeminiClient::from_env(&config)?);
    let extractor = FieldExtractor::new(llm, config.clone());
    let runner = ExtractionRunner::new(registry, extractor, config);

    let (tx, rx) = mpsc::channel();
    let results = std::thread::scope(|scope| {
        scope.spawn(move || report_progress(rx));
        let results = runner.process_banks(
            &args.banks,
            &documents.text,
            threshold,
            &attachments,
            Some(&tx),
            None,
        );
        drop(tx);
        results
    });

    let mut payloads = BTreeMap::new();
    for (bank, result) in results {
        payloads.insert(bank, result?);
    }

    write_output(&payloads, args.format, args.out.as_deref())
}

fn read_attachment(path: &Path) -> Result<Attachment, CliError> {
    Attachment::from_path(path).map_err(|source| CliError::Input {
        path: path.to_path_buf(),
        source,
    })
}

fn report_progress(rx: mpsc::Receiver<ExtractionEvent>) {
    for event in rx {
        match event {
            ExtractionEvent::Started {
                bank,
                total_batches,
                required_fields,
                ..
            } => eprintln!("[{bank}] {required_fields} fields in {total_batches} batches"),
            ExtractionEvent::BatchCompleted {
                bank,
                batch_index,
                total_batches,
                snapshot,
                ..
            } => eprintln!(
                "[{bank}] batch {}/{total_batches} done, {} fields need review",
                batch_index + 1,
                snapshot.missing_fields.len()
            ),
            ExtractionEvent::Completed { bank, missing, .. } => {
                eprintln!("[{bank}] complete, {missing} fields need review")
            }
            ExtractionEvent::Cancelled { bank, .. } => eprintln!("[{bank}] cancelled"),
        }
    }
}

fn write_output(
    payloads: &BTreeMap<String, ExtractionPayload>,
    format: OutputFormat,
    out: Option<&Path>,
) -> Result<(), CliError> {
    let mut sink: Box<dyn Write> = match out {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };

    match format {
        OutputFormat::Json => {
            let json = export::to_json(payloads)?;
            writeln!(sink, "{json}")?;
        }
        OutputFormat::Csv => export::write_csv(&mut sink, payloads.values())?,
    }
    sink.flush()?;
    Ok(())
}
