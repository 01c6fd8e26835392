#![forbid(unsafe_code)]

mod console;
mod logger;

use std::{path::Path, process::ExitCode, sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use apis::{
    ai_api::AiFacade,
    circuit_breaker::{run_health_check, CircuitBreaker},
    database::MemberStore,
    kv::KvStore,
    schedule_api::RotatingClient,
    schedule_scraper::ScheduleScraper,
    schedule_service::ScheduleService,
    youtube_api::YoutubeClient,
};
use bot::{
    chat_bot::ChatBot,
    commands::{CommandContext, CommandPipeline},
    nl_parser::{self, NlParser},
    profile_cache::ProfileCache,
    resolver::{ChannelSelector, MemberResolver, RemoteSearch},
    scheduler::{NotificationScheduler, ScheduleSource},
    subscriptions::SubscriptionRegistry,
    transport::ChatTransport,
};
use utility::{config::Config, members::MemberDirectory};

const SCHEDULE_PAGE_URL: &str = "https://schedule.hololive.tv/simple";
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

const EXIT_CLEAN: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

enum RunOutcome {
    Clean,
    Interrupted,
}

fn main() -> ExitCode {
    let config = match Config::load(get_config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let _logging_guard = match logger::init(&config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to start the runtime.");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match rt.block_on(async_main(config)) {
        Ok(RunOutcome::Clean) => ExitCode::from(EXIT_CLEAN),
        Ok(RunOutcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup failed.");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

#[instrument(skip(config))]
async fn async_main(config: Arc<Config>) -> anyhow::Result<RunOutcome> {
    let directory = Arc::new(MemberDirectory::new(
        config.members.clone(),
        config.resolver.honorific_suffixes.clone(),
    )?);

    let kv = if config.kv.is_remote() {
        KvStore::connect(&config.kv.url()).await?
    } else {
        warn!("No KV host configured, using the in-process store.");
        KvStore::in_memory()
    };

    let schedule_breaker = Arc::new(CircuitBreaker::new("schedule-api"));
    let client = Arc::new(RotatingClient::new(
        config.primary_api.base_url.clone(),
        config.primary_api.keys.clone(),
        Arc::clone(&schedule_breaker),
    )?);
    let scraper = Arc::new(ScheduleScraper::new(SCHEDULE_PAGE_URL)?);

    let youtube = if config.secondary_api.enabled {
        Some(Arc::new(YoutubeClient::new(
            config.secondary_api.key.clone(),
            config.secondary_api.daily_quota,
            config.secondary_api.safety_margin,
            config.secondary_api.concurrency,
        )?))
    } else {
        None
    };

    let store = if config.durable.is_configured() {
        let store = MemberStore::connect(&config.durable).await?;
        store.ensure_schema().await?;
        Some(Arc::new(store))
    } else {
        warn!("No durable store configured, member profiles limited to the static dataset.");
        None
    };

    let schedule = Arc::new(ScheduleService::new(
        Arc::clone(&client),
        Arc::clone(&scraper),
        youtube,
        kv.clone(),
        Arc::clone(&directory),
        config.primary_api.org.clone(),
        config.primary_api.exclude.clone(),
    ));

    let profiles = Arc::new(ProfileCache::new(kv.clone(), store));

    if let Err(e) = profiles.warm_up().await {
        warn!(error = %e, "Profile warm-up failed, continuing cold.");
    }

    let nl = if config.ai.primary.api_key.is_empty() {
        warn!("No AI key configured, natural-language commands disabled.");
        None
    } else {
        let ai_breaker = Arc::new(CircuitBreaker::new("ai"));
        let facade = Arc::new(AiFacade::new(
            &config.ai,
            nl_parser::system_prompt(&directory),
            ai_breaker,
        )?);

        Some(Arc::new(NlParser::new(facade)))
    };

    let resolver = Arc::new(MemberResolver::new(
        Arc::clone(&directory),
        kv.clone(),
        Arc::clone(&schedule) as Arc<dyn RemoteSearch>,
        nl.clone()
            .map(|nl| nl as Arc<dyn ChannelSelector>),
        Duration::from_secs(config.resolver.memo_ttl_secs),
    ));

    let registry = SubscriptionRegistry::new(kv.clone());

    let scheduler = Arc::new(NotificationScheduler::new(
        kv.clone(),
        Arc::clone(&schedule) as Arc<dyn ScheduleSource>,
        config.notification.target_minutes(),
        Duration::from_secs(config.notification.check_interval_secs),
        config.notification.concurrency,
    ));

    let (message_tx, message_rx) = mpsc::channel(64);
    let (notify_tx, notify_rx) = mpsc::channel(64);
    let (exit_tx, exit_rx) = watch::channel(false);

    tokio::spawn(Arc::clone(&scheduler).run(notify_tx, exit_rx.clone()));

    {
        let client = Arc::clone(&client);
        tokio::spawn(run_health_check(
            schedule_breaker,
            move || {
                let client = Arc::clone(&client);
                async move { client.probe_health().await }
            },
            exit_rx.clone(),
        ));
    }

    tokio::spawn(console::read_stdin(message_tx));

    let transport = Arc::new(console::ConsoleTransport {}) as Arc<dyn ChatTransport>;

    let pipeline = CommandPipeline::new(
        Arc::clone(&config),
        CommandContext {
            registry,
            resolver,
            schedule,
            profiles,
            kv,
        },
        nl,
    );

    let chat_bot = Arc::new(ChatBot::new(pipeline, scheduler, transport));
    let mut bot_task = tokio::spawn(chat_bot.run(message_rx, notify_rx, exit_rx));

    info!("Startup complete.");

    let outcome = tokio::select! {
        result = &mut bot_task => {
            if let Err(e) = result {
                error!(error = %e, "Chat bot task failed.");
            }

            info!(task = "Main thread", "Shutting down.");
            return Ok(RunOutcome::Clean);
        }

        () = wait_for_signal() => RunOutcome::Interrupted,
    };

    info!("Signal received, draining tasks.");
    let _ = exit_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_DEADLINE, bot_task).await.is_err() {
        warn!("Drain deadline exceeded, terminating.");
    }

    info!(task = "Main thread", "Shutting down.");
    Ok(outcome)
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "SIGINT handler failed.");
            return std::future::pending().await;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "SIGTERM handler failed.");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => info!("SIGINT received."),
        _ = terminate.recv() => info!("SIGTERM received."),
    }
}

fn get_config_path() -> &'static Path {
    Path::new("settings")
}
