mod analyzer;
mod campaign;
mod config;
mod db;
mod db_types;
mod engine;
mod error;
mod flow;
mod handlers;
mod llm;
mod normalizer;
mod openai_types;
mod prompts;
mod retriever;
mod synthesizer;
mod telephony;
mod transcript;
mod twilio_types;
mod types;
mod utils;

use crate::analyzer::{AnalysisQueue, CallAnalyzer, RetryPolicy};
use crate::campaign::CampaignRunner;
use crate::config::Config;
use crate::db::Db;
use crate::db_types::{AddContact, CampaignStatus, ContactStatus, NewContact};
use crate::engine::ConversationEngine;
use crate::error::{handle_error, AppError};
use crate::flow::CallFlowController;
use crate::llm::{ChatModel, OpenAIClient};
use crate::synthesizer::{GoogleTts, SpeechProvider, SpeechSynthesizer, VoiceParams};
use crate::telephony::TwilioClient;
use crate::transcript::TranscriptStore;
use crate::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

const SWEEP_EVERY: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "twilio-callbot")]
#[command(about = "Czech voice bot for inbound reception and outbound sales calls", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server.
    Serve,
    /// Manage and run calling campaigns.
    #[command(subcommand)]
    Campaign(CampaignCommand),
    /// Manage contacts.
    #[command(subcommand)]
    Contacts(ContactsCommand),
    /// Inspect stored call records.
    #[command(subcommand)]
    Calls(CallsCommand),
    /// List post-call analyses that failed permanently.
    DeadLetters,
}

#[derive(Subcommand)]
enum CampaignCommand {
    Create {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    List,
    /// Dial the campaign's pending contacts.
    Run {
        campaign_id: i64,
        #[arg(short, long)]
        max_calls: Option<usize>,
    },
    Stats {
        campaign_id: i64,
    },
    Pause {
        campaign_id: i64,
    },
    Resume {
        campaign_id: i64,
    },
}

#[derive(Subcommand)]
enum ContactsCommand {
    Add {
        name: String,
        phone: String,
        #[arg(short, long)]
        campaign: Option<i64>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Import a `name,phone,company,email` CSV file.
    Import {
        path: PathBuf,
        #[arg(short, long)]
        campaign: Option<i64>,
    },
    List {
        #[arg(short, long)]
        campaign: Option<i64>,
        #[arg(short, long)]
        status: Option<ContactStatus>,
    },
}

#[derive(Subcommand)]
enum CallsCommand {
    List {
        #[arg(short, long)]
        campaign: Option<i64>,
    },
}

pub(crate) fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/inbound", post(handlers::inbound))
        .route("/voice", post(handlers::inbound))
        .route("/outbound", post(handlers::outbound))
        .route("/process", post(handlers::process))
        .route(
            "/process/:retry_count/:elapsed_seconds",
            post(handlers::process),
        )
        .route("/call-status", post(handlers::call_status))
        .route("/audio/:file", get(handlers::audio_handler))
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .with_state(app_state)
}

fn init_tracing(level: LevelFilter) {
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("sqlx", LevelFilter::WARN),
            ("twilio_callbot", level),
        ]));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {e}");
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LevelFilter::INFO);
            handle_error(&e);
            std::process::exit(1);
        }
    };
    init_tracing(config.log_level.parse().unwrap_or(LevelFilter::DEBUG));

    if let Err(e) = run(cli.command, config).await {
        handle_error(&e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: Config) -> Result<(), AppError> {
    let db = Db::connect(&config.database_url).await?;
    match command {
        Commands::Serve => serve(config, db).await,
        Commands::Campaign(command) => campaign(command, config, db).await,
        Commands::Contacts(command) => contacts(command, db).await,
        Commands::Calls(CallsCommand::List { campaign }) => print_json(&db.list_calls(campaign).await?),
        Commands::DeadLetters => print_json(&db.list_dead_letters().await?),
    }
}

fn print_json(value: &impl Serialize) -> Result<(), AppError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::BadRequest(format!("unprintable output: {e}")))?;
    println!("{out}");
    Ok(())
}

async fn build_synthesizer(
    config: &Config,
    http_client: &reqwest::Client,
) -> Result<SpeechSynthesizer, AppError> {
    let provider = config.google_tts_api_key.as_deref().map(|key| {
        Arc::new(GoogleTts::new(http_client.clone(), &config.google_tts_base_url, key))
            as Arc<dyn SpeechProvider>
    });
    if provider.is_none() {
        info!("GOOGLE_TTS_API_KEY not set; using the telephony provider's built-in voice");
    }
    let voice = VoiceParams {
        language: config.tts_language.clone(),
        name: config.tts_voice.clone(),
    };
    SpeechSynthesizer::load(provider, voice, &config.audio_dir, &config.public_base_url).await
}

async fn serve(config: Config, db: Db) -> Result<(), AppError> {
    let http_client = reqwest::Client::new();
    let model: Arc<dyn ChatModel> = Arc::new(OpenAIClient::new(
        http_client.clone(),
        &config.openai_base_url,
        &config.openai_api_key,
        &config.openai_model,
    ));
    let synthesizer = Arc::new(build_synthesizer(&config, &http_client).await?);

    let engine = Arc::new(ConversationEngine::new(
        Arc::new(TranscriptStore::new()),
        model.clone(),
    ));
    let (analysis, worker) =
        AnalysisQueue::new(CallAnalyzer::new(model), db.clone(), RetryPolicy::default());
    let controller = CallFlowController::new(engine, synthesizer.clone(), analysis);

    let app_state = Arc::new(AppState {
        config,
        db,
        controller,
        synthesizer,
    });

    tokio::spawn(worker.run());
    let sweeper = app_state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_EVERY);
        loop {
            ticker.tick().await;
            let removed = sweeper.controller.sweep_sessions(sweeper.config.session_ttl);
            if removed > 0 {
                debug!(removed, "swept stale call sessions");
            }
        }
    });

    let addr = app_state.config.bind_addr;
    info!(%addr, base_url=%app_state.config.public_base_url, "listening");
    axum::Server::bind(&addr)
        .serve(router(app_state).into_make_service())
        .await
        .map_err(|e| {
            error!(error=%e, "server stopped");
            AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })
}

async fn campaign(command: CampaignCommand, config: Config, db: Db) -> Result<(), AppError> {
    match command {
        CampaignCommand::Create { name, description } => {
            let id = db.create_campaign(&name, description.as_deref()).await?;
            println!("{id}");
        }
        CampaignCommand::List => print_json(&db.list_campaigns().await?)?,
        CampaignCommand::Run {
            campaign_id,
            max_calls,
        } => {
            let http_client = reqwest::Client::new();
            let telephony = Arc::new(TwilioClient::new(
                http_client.clone(),
                &config.twilio_api_base,
                &config.twilio_account_sid,
                &config.twilio_auth_token,
            ));
            let synthesizer = Arc::new(build_synthesizer(&config, &http_client).await?);
            let runner = CampaignRunner::new(db.clone(), telephony, synthesizer, &config);
            let summary = runner.run(campaign_id, max_calls).await?;
            println!(
                "placed {} call(s), {} failed{}",
                summary.placed,
                summary.failed,
                if summary.stopped_outside_hours {
                    ", stopped outside calling hours"
                } else {
                    ""
                }
            );
        }
        CampaignCommand::Stats { campaign_id } => print_json(&db.campaign_stats(campaign_id).await?)?,
        CampaignCommand::Pause { campaign_id } => {
            db.set_campaign_status(campaign_id, CampaignStatus::Paused).await?
        }
        CampaignCommand::Resume { campaign_id } => {
            db.set_campaign_status(campaign_id, CampaignStatus::Active).await?
        }
    }
    Ok(())
}

async fn contacts(command: ContactsCommand, db: Db) -> Result<(), AppError> {
    match command {
        ContactsCommand::Add {
            name,
            phone,
            campaign,
            company,
            email,
        } => {
            let contact = NewContact {
                campaign_id: campaign,
                name,
                phone,
                company,
                email,
            };
            match db.add_contact(&contact).await? {
                AddContact::Added(id) => println!("{id}"),
                AddContact::AlreadyExists => println!("{} already exists", contact.phone),
            }
        }
        ContactsCommand::Import { path, campaign } => {
            let summary = db.import_contacts_csv(campaign, &path).await?;
            println!("imported {}, skipped {}", summary.imported, summary.skipped);
        }
        ContactsCommand::List { campaign, status } => {
            print_json(&db.list_contacts(campaign, status).await?)?
        }
    }
    Ok(())
}
