use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use homedir::my_home;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod duplicates;
mod library;
mod lock;
mod normalize;
mod semantic;

use cli::{CacheAction, Command, OutputFormat};
use config::Config;
use library::{BookId, BookRecord};
use semantic::cache::needs_refresh;
use semantic::{CacheStore, ModelProvider, SearchHit, SemanticSearchEngine};

/// Characters of description shown next to each search result
const DESCRIPTION_PREVIEW_CHARS: usize = 200;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let base_path = get_base_path()?;
    tracing::debug!(base_path = %base_path.display(), "using data directory");
    let mut config = Config::load_with(&base_path)
        .with_context(|| format!("failed to load config from {}", base_path.display()))?;
    config.apply_overrides(|key| std::env::var(key).ok())?;

    match args.command {
        Command::Search {
            query,
            top_n,
            library,
            device,
            force_refresh,
        } => {
            let records = library::read_library(library.library.as_deref())?;
            let _lock = lock::FileLock::try_acquire(config.base_path())?;

            let mut engine = create_engine(&config);
            let top_n = top_n.unwrap_or_else(|| engine.default_top_n());
            let hits = engine.search(&query, top_n, &records, device, force_refresh)?;
            if let Some(device) = engine.provider().device() {
                log::info!("searched {} books on {}", records.len(), device);
            }

            let results: Vec<SearchResult> = hits.iter().map(SearchResult::from).collect();
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Command::Duplicates {
            library,
            threshold,
            format,
        } => {
            let records = library::read_library(library.library.as_deref())?;
            let threshold = threshold.unwrap_or(config.duplicates.fuzzy_threshold);
            let report = duplicates::find_all_duplicates(&records, threshold)?;

            match format {
                OutputFormat::Json => {
                    let output = DuplicatesOutput {
                        summary: report.summary(),
                        report: &report,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Markdown => {
                    print!("{}", duplicates::format_markdown(&report, &records));
                }
            }
        }

        Command::Cache {
            action: CacheAction::Status { library },
        } => {
            let records = match library {
                Some(path) => Some(library::read_library(Some(path.as_path()))?),
                None => None,
            };
            let status = cache_status(&config, records.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::Cache {
            action: CacheAction::Clear,
        } => {
            let _lock = lock::FileLock::try_acquire(config.base_path())?;
            create_engine(&config).clear_cache()?;
            println!("Embedding cache cleared");
        }
    }

    Ok(())
}

/// Get the data directory
fn get_base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("SHELFSCAN_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/shelfscan"))
}

fn create_engine(config: &Config) -> SemanticSearchEngine {
    let settings = config.semantic_search.clone();
    let provider = ModelProvider::fastembed(
        &settings.model,
        settings.device,
        config.base_path().to_path_buf(),
        Some(Duration::from_secs(settings.download_timeout_secs)),
    );
    let store = CacheStore::new(config.cache_dir());

    SemanticSearchEngine::new(settings, provider, store)
}

#[derive(Serialize)]
struct SearchResult<'a> {
    id: BookId,
    title: &'a str,
    authors: &'a [String],
    similarity_score: f32,
    identifiers: &'a std::collections::BTreeMap<String, String>,
    tags: &'a std::collections::BTreeSet<String>,
    series: Option<&'a str>,
    publisher: Option<&'a str>,
    description_preview: Option<String>,
}

impl<'a> From<&SearchHit<'a>> for SearchResult<'a> {
    fn from(hit: &SearchHit<'a>) -> Self {
        let record: &'a BookRecord = hit.record;
        Self {
            id: record.id,
            title: &record.title,
            authors: &record.authors,
            similarity_score: hit.score,
            identifiers: &record.identifiers,
            tags: &record.tags,
            series: record.series.as_deref(),
            publisher: record.publisher.as_deref(),
            description_preview: record.description.as_deref().map(description_preview),
        }
    }
}

fn description_preview(description: &str) -> String {
    let text = normalize::strip_markup(description);
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() <= DESCRIPTION_PREVIEW_CHARS {
        return text;
    }
    let preview: String = text.chars().take(DESCRIPTION_PREVIEW_CHARS).collect();
    format!("{}...", preview.trim_end())
}

#[derive(Serialize)]
struct DuplicatesOutput<'a> {
    summary: duplicates::DuplicateSummary,
    #[serde(flatten)]
    report: &'a duplicates::DuplicateReport,
}

#[derive(Serialize, Debug, PartialEq)]
struct CacheStatusOutput {
    cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    age_hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    would_refresh: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    changed_rows: Option<usize>,
}

/// Describe the durable cache and, given the library, whether the next
/// search would rebuild it. Never loads a model.
fn cache_status(config: &Config, records: Option<&[BookRecord]>) -> anyhow::Result<CacheStatusOutput> {
    let engine = create_engine(config);
    let Some(status) = engine.status()? else {
        return Ok(CacheStatusOutput {
            cached: false,
            model_name: None,
            dimensions: None,
            rows: None,
            age_hours: None,
            would_refresh: records.map(|_| true),
            changed_rows: None,
        });
    };

    let mut output = CacheStatusOutput {
        cached: true,
        model_name: Some(status.model_name.clone()),
        dimensions: Some(status.dimensions),
        rows: Some(status.rows),
        age_hours: Some((chrono::Utc::now() - status.refreshed_at).num_hours()),
        would_refresh: None,
        changed_rows: None,
    };

    if let Some(records) = records {
        let manifest = engine.durable_manifest();
        let ids: Vec<BookId> = records.iter().map(|record| record.id).collect();

        output.would_refresh = Some(needs_refresh(
            manifest.as_ref(),
            &ids,
            engine.max_cache_age(),
            config.semantic_search.force_refresh,
        ));
        output.changed_rows = manifest.map(|manifest| manifest.changed_rows(records));
    }

    Ok(output)
}
