use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use murmur_audio::ingress::AudioIngress;
use murmur_core::config::Config;
use murmur_enrichment::handlers::{
    AliasDetectionHandler, IntentKeywordsHandler, ProsodyInterpretationHandler,
    ResponseMappingHandler,
};
use murmur_enrichment::handler::TaskHandler;
use murmur_enrichment::model_manager::ModelManager;
use murmur_enrichment::worker::EnrichmentWorker;
use murmur_pipeline::boundary::BoundaryDetector;
use murmur_pipeline::exchange::ExchangeDetector;
use murmur_pipeline::session_manager::SessionManager;
use murmur_pipeline::transcription::TranscriptionService;
use murmur_providers::embedding::OllamaEmbeddings;
use murmur_providers::ollama::OllamaClient;
use murmur_providers::remote::RemoteTranscriptionProvider;
use murmur_providers::whisper::WhisperProvider;
use murmur_providers::{EmbeddingProvider, LlmClient, TranscriptionProvider};
use murmur_store::aliases::SpeakerAliasRepository;
use murmur_store::db;
use murmur_store::exchanges::ExchangeRepository;
use murmur_store::ideas::IdeaRepository;
use murmur_store::queue::EnrichmentQueueRepository;
use murmur_store::sessions::SessionRepository;
use murmur_store::utterance_index::UtteranceIndex;
use murmur_store::utterances::UtteranceRepository;
use murmur_store::vector::QdrantHttp;

#[derive(Parser)]
#[command(
    name = "murmur",
    about = "Voice-channel transcription and conversational enrichment pipeline",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (JSON5)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline until interrupted
    Run,

    /// Transcribe a WAV file with the configured provider and exit
    Transcribe {
        /// Path to a 16-bit PCM mono WAV file
        file: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "murmur=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("MURMUR_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("murmur.json5"));
    Ok(Config::load(&path)?)
}

fn build_stt_provider(config: &Config) -> anyhow::Result<Arc<dyn TranscriptionProvider>> {
    match config.transcription.provider.as_str() {
        "whisper" => Ok(Arc::new(WhisperProvider::new(
            &config.transcription.whisper_model_path,
            config.transcription.language.clone(),
        )?)),
        "remote" => Ok(Arc::new(RemoteTranscriptionProvider::new(
            &config.transcription.remote,
            Duration::from_secs(config.transcription.request_timeout_sec),
        ))),
        other => anyhow::bail!("unknown transcription provider {other:?}"),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let pool = db::open_pool(&config.database.url).await?;
    db::init_schema(&pool).await?;

    let session_repo = SessionRepository::new(pool.clone());
    let utterance_repo = UtteranceRepository::new(pool.clone());
    let alias_repo = SpeakerAliasRepository::new(pool.clone());
    let queue_repo = EnrichmentQueueRepository::new(pool.clone());

    let ollama: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(&config.ollama));
    if !ollama.health().await {
        warn!("Ollama is unreachable; enrichment and embeddings will fail until it returns");
    }
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OllamaEmbeddings::new(
        ollama.clone(),
        config.ollama.embed_model.clone(),
        config.ollama.embed_dimension,
    ));

    let vector_store = Arc::new(QdrantHttp::new(&config.qdrant));
    let idea_repo = Arc::new(IdeaRepository::new(
        vector_store.clone(),
        embedder.clone(),
        config.qdrant.ideas_collection.clone(),
    ));
    let exchange_repo = Arc::new(ExchangeRepository::new(
        vector_store.clone(),
        embedder.clone(),
        config.qdrant.exchanges_collection.clone(),
    ));
    let utterance_index = Arc::new(UtteranceIndex::new(
        vector_store.clone(),
        embedder.clone(),
        config.qdrant.utterances_collection.clone(),
    ));

    // The pipeline stays up for transcripts even when the vector side is
    // down; ideas simply stop accumulating until it returns.
    for (name, result) in [
        ("ideas", idea_repo.init().await),
        ("exchanges", exchange_repo.init().await),
        ("utterances", utterance_index.init().await),
    ] {
        if let Err(e) = result {
            warn!(collection = name, error = %e, "Vector collection init failed");
        }
    }

    let sessions = Arc::new(SessionManager::new(
        session_repo.clone(),
        config.session.timeout_sec,
    ));

    let exchange_detector = Arc::new(ExchangeDetector::new(
        idea_repo.clone(),
        exchange_repo.clone(),
        queue_repo.clone(),
        config.exchange.clone(),
    ));
    let boundary = Arc::new(BoundaryDetector::new(
        idea_repo.clone(),
        queue_repo.clone(),
        Some(exchange_detector.clone()),
        config.boundary.clone(),
    ));
    sessions.add_end_listener(boundary.clone()).await;

    let stt = build_stt_provider(&config)?;
    let service = Arc::new(TranscriptionService::new(
        config.audio.clone(),
        Duration::from_secs(config.transcription.request_timeout_sec),
        stt,
        sessions.clone(),
        utterance_repo.clone(),
        alias_repo.clone(),
        Some(utterance_index),
    ));
    service.set_boundary_detector(boundary.clone()).await;

    // Shutdown order: ingress first, then the monitors, then the worker.
    let ingress_cancel = CancellationToken::new();
    let monitor_cancel = CancellationToken::new();
    let worker_cancel = CancellationToken::new();

    let ingress = AudioIngress::start(
        config.audio.ingress_queue_capacity,
        service.clone(),
        ingress_cancel.clone(),
    );
    let _ = ingress; // handed to the platform voice-receive adapter
    service.clone().start_monitor(monitor_cancel.clone());
    sessions.clone().start_timeout_monitor(monitor_cancel.clone());

    if config.enrichment.worker_enabled {
        let model_manager = Arc::new(ModelManager::new(ollama.clone()));
        let handlers: Vec<Arc<dyn TaskHandler>> = vec![
            Arc::new(AliasDetectionHandler::new(
                alias_repo.clone(),
                idea_repo.clone(),
            )),
            Arc::new(ProsodyInterpretationHandler::new(
                idea_repo.clone(),
                utterance_repo.clone(),
                config.enrichment.clone(),
            )),
            Arc::new(ResponseMappingHandler::new(
                idea_repo.clone(),
                config.enrichment.clone(),
            )),
            Arc::new(IntentKeywordsHandler::new(
                idea_repo.clone(),
                ollama.clone(),
                config.ollama.chat_model.clone(),
            )),
        ];
        let worker = Arc::new(EnrichmentWorker::new(
            queue_repo.clone(),
            handlers,
            model_manager,
            config.enrichment.clone(),
        ));
        worker.start(worker_cancel.clone());
    } else {
        info!("Enrichment worker disabled by config");
    }

    info!(
        provider = %service.current_provider_name().await,
        "Pipeline ready; waiting for audio"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Stop taking audio, drain what is buffered with the current provider,
    // then stop the loops and let the worker finish its batch.
    ingress_cancel.cancel();
    service.flush_all().await;
    monitor_cancel.cancel();
    worker_cancel.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn transcribe_file(config: Config, file: &Path) -> anyhow::Result<()> {
    let provider = build_stt_provider(&config)?;
    let result = provider.transcribe_file(file).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Transcribe { file } => transcribe_file(config, &file).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
