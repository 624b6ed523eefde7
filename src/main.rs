use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use taxo::classifier::TrainingStatus;
use taxo::models::{DocumentId, TagId};
use taxo::ollama::{OllamaAssessor, OllamaClientBuilder, OllamaExtractor};
use taxo::refiner::RefineStatus;
use taxo::{
    CategoryClassifier, Database, DocumentClusterer, DocumentStore, TagRefiner, TagRegistry,
};

/// taxo - tag normalization, clustering and classification engine
#[derive(Parser)]
#[command(name = "taxo")]
#[command(about = "Normalizes tags, clusters documents and classifies them into categories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a document to the store
    Add(AddCommand),
    /// Run the automatic tagging pass over a document
    Tag(TagCommand),
    /// Recompute document clusters from embeddings
    Cluster(ClusterCommand),
    /// Train the category classifier from labeled documents
    Train,
    /// Predict category probabilities for a document
    Predict(PredictCommand),
    /// Re-evaluate a document's tags against its content
    Refine(RefineCommand),
    /// Show tags that co-occur with a tag
    Related(RelatedCommand),
    /// List all tags with usage counts
    Tags,
    /// List all categories
    Categories,
}

#[derive(Parser)]
struct AddCommand {
    /// The document content
    #[arg(value_name = "CONTENT")]
    content: String,
}

#[derive(Parser)]
struct TagCommand {
    /// Document id to tag
    #[arg(value_name = "DOCUMENT_ID")]
    document_id: i64,
}

#[derive(Parser)]
struct ClusterCommand {
    /// Neighborhood radius for density clustering
    #[arg(long, default_value_t = 0.3)]
    eps: f64,

    /// Minimum neighborhood size for a core point
    #[arg(long, default_value_t = 3)]
    min_pts: usize,
}

#[derive(Parser)]
struct PredictCommand {
    /// Document id to classify
    #[arg(value_name = "DOCUMENT_ID")]
    document_id: i64,
}

#[derive(Parser)]
struct RefineCommand {
    /// Document id to refine
    #[arg(value_name = "DOCUMENT_ID")]
    document_id: i64,
}

#[derive(Parser)]
struct RelatedCommand {
    /// Tag id to query
    #[arg(value_name = "TAG_ID")]
    tag_id: i64,

    /// Maximum number of related tags to show
    #[arg(short, long, default_value_t = 10)]
    limit: usize,
}

fn main() {
    // .env is optional; absence is not an error.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = run(&cli.command);
    if let Err(e) = result {
        let exit_code = if is_user_error(&e) { 1 } else { 2 };
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code);
    }
}

/// Distinguishes user mistakes (bad input, unknown ids) from internal
/// failures for the exit code.
fn is_user_error(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<taxo::Error>(),
        Some(taxo::Error::NotFound { .. } | taxo::Error::Validation(_) | taxo::Error::NotTrained)
    )
}

fn run(command: &Commands) -> Result<()> {
    let db_path = get_database_path()?;
    ensure_database_directory(&db_path)?;
    let db = Arc::new(Database::open(&db_path).context("Failed to open database")?);

    match command {
        Commands::Add(cmd) => handle_add(db, cmd),
        Commands::Tag(cmd) => handle_tag(db, cmd),
        Commands::Cluster(cmd) => handle_cluster(db, cmd),
        Commands::Train => handle_train(db),
        Commands::Predict(cmd) => handle_predict(db, cmd),
        Commands::Refine(cmd) => handle_refine(db, cmd),
        Commands::Related(cmd) => handle_related(db, cmd),
        Commands::Tags => handle_tags(db),
        Commands::Categories => handle_categories(db),
    }
}

fn handle_add(db: Arc<Database>, cmd: &AddCommand) -> Result<()> {
    let store = DocumentStore::new(db);
    let document = store.add_document(&cmd.content, None)?;
    println!("Document added (id: {})", document.id());
    Ok(())
}

fn handle_tag(db: Arc<Database>, cmd: &TagCommand) -> Result<()> {
    let client = Arc::new(OllamaClientBuilder::new().build()?);
    let model = client.model().to_string();
    let extractor = OllamaExtractor::new(client, model);

    let registry = TagRegistry::new(Arc::clone(&db));
    let store = DocumentStore::new(db);
    let report = taxo::tagging::tag_document(
        &registry,
        &store,
        &extractor,
        DocumentId::new(cmd.document_id),
    )?;

    println!(
        "Tagged document {} ({} concepts, {} tags attached)",
        cmd.document_id, report.concept_count, report.attached_count
    );
    Ok(())
}

fn handle_cluster(db: Arc<Database>, cmd: &ClusterCommand) -> Result<()> {
    let clusterer = DocumentClusterer::new(db);
    let report = clusterer.update_clusters(cmd.eps, cmd.min_pts)?;
    println!(
        "Clustered {} documents into {} clusters ({} noise)",
        report.total_documents, report.clusters_found, report.noise_documents
    );
    Ok(())
}

fn handle_train(db: Arc<Database>) -> Result<()> {
    let classifier = CategoryClassifier::new(db);
    let report = classifier.train_model(None)?;
    match report.status {
        TrainingStatus::Trained => {
            println!(
                "Model trained on {} examples across {} categories (accuracy {:.2})",
                report.data_point_count,
                report.categories.map_or(0, |c| c.len()),
                report.accuracy.unwrap_or(0.0)
            );
        }
        TrainingStatus::InsufficientData => {
            println!(
                "Not enough labeled documents to train ({} available)",
                report.data_point_count
            );
        }
    }
    Ok(())
}

fn handle_predict(db: Arc<Database>, cmd: &PredictCommand) -> Result<()> {
    let classifier = CategoryClassifier::new(db);
    if !classifier.load_committed()? {
        anyhow::bail!(taxo::Error::NotTrained);
    }

    let top = classifier.classify_document(DocumentId::new(cmd.document_id))?;
    println!(
        "Document {} classified as '{}' ({:.1}%)",
        cmd.document_id,
        top.name,
        top.probability * 100.0
    );
    Ok(())
}

fn handle_refine(db: Arc<Database>, cmd: &RefineCommand) -> Result<()> {
    let client = Arc::new(OllamaClientBuilder::new().build()?);
    let model = client.model().to_string();
    let assessor = Arc::new(OllamaAssessor::new(client, model));

    let registry = Arc::new(TagRegistry::new(Arc::clone(&db)));
    let refiner = TagRefiner::new(db, registry, assessor);
    let report = refiner.refine_document_tags(DocumentId::new(cmd.document_id))?;

    match report.status {
        RefineStatus::Refined => println!(
            "Refined document {} ({} removed, {} added)",
            cmd.document_id, report.removed_count, report.added_count
        ),
        RefineStatus::Skipped => println!("Nothing to refine for document {}", cmd.document_id),
    }
    Ok(())
}

fn handle_related(db: Arc<Database>, cmd: &RelatedCommand) -> Result<()> {
    let registry = Arc::new(TagRegistry::new(Arc::clone(&db)));
    let refiner = TagRefiner::new(
        db,
        registry,
        // Related-tag queries never call the assessor.
        Arc::new(NoopAssessor),
    );
    let related = refiner.suggest_related_tags(TagId::new(cmd.tag_id), cmd.limit)?;

    if related.related.is_empty() {
        println!("No documents carry tag '{}'", related.tag_name);
        return Ok(());
    }

    println!(
        "Tags related to '{}' ({} documents):",
        related.tag_name, related.document_count
    );
    for entry in related.related {
        println!(
            "  {} ({} shared, {:.0}%)",
            entry.name,
            entry.co_occurrence_count,
            entry.frequency * 100.0
        );
    }
    Ok(())
}

fn handle_tags(db: Arc<Database>) -> Result<()> {
    let registry = TagRegistry::new(db);
    let tags = registry.list_tags()?;
    if tags.is_empty() {
        println!("No tags yet");
        return Ok(());
    }
    for tag in tags {
        if tag.synonyms().is_empty() {
            println!("{} ({} uses)", tag.name(), tag.usage_count());
        } else {
            println!(
                "{} ({} uses, aka {})",
                tag.name(),
                tag.usage_count(),
                tag.synonyms().join(", ")
            );
        }
    }
    Ok(())
}

fn handle_categories(db: Arc<Database>) -> Result<()> {
    let store = DocumentStore::new(db);
    let categories = store.list_categories()?;
    if categories.is_empty() {
        println!("No categories yet");
        return Ok(());
    }
    for category in categories {
        match category.description() {
            Some(description) => println!("{} - {}", category.name(), description),
            None => println!("{}", category.name()),
        }
    }
    Ok(())
}

struct NoopAssessor;

impl taxo::refiner::RelevanceAssessor for NoopAssessor {
    fn assess(
        &self,
        _content: &str,
        _current_tags: &[(TagId, String)],
    ) -> anyhow::Result<taxo::refiner::Assessment> {
        anyhow::bail!("no assessor configured")
    }
}

/// Returns the path as `{data_dir}/taxo/taxo.db`.
fn get_database_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Failed to determine data directory"))?;

    Ok(data_dir.join("taxo").join("taxo.db"))
}

fn ensure_database_directory(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }
    Ok(())
}
