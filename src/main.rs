use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};

use sms_ingest::config::{PipelineConfig, PrefsSnapshot, StaticPrefs};
use sms_ingest::effects::{LoggingBadge, LoggingNotifications, LoggingShortcuts};
use sms_ingest::pipeline::{
    CatchUpDeps, CatchUpJob, PersistStage, Pipeline, ProcessDeps, ProcessStage,
    spawn_catchup_loop,
};
use sms_ingest::policy::{AddressListEvaluator, NoContacts, RegexContentFilter};
use sms_ingest::receiver::{self, SmsDelivery};
use sms_ingest::scheduler::JobScheduler;
use sms_ingest::store::{ConversationStore, LibSqlBackend, MessageStore};
use sms_ingest::sync::NullSyncService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let db_path = std::env::var("SMS_INGEST_DB_PATH")
        .unwrap_or_else(|_| "./data/sms-ingest.db".to_string());

    let catchup_interval_secs: u64 = std::env::var("SMS_INGEST_CATCHUP_INTERVAL_SECS")
        .unwrap_or_else(|_| "900".to_string())
        .parse()
        .unwrap_or(900);

    let drop_blocked = env_flag("SMS_INGEST_DROP_BLOCKED");
    let unread_at_top = env_flag("SMS_INGEST_UNREAD_AT_TOP");

    let config = PipelineConfig {
        catchup_interval: Duration::from_secs(catchup_interval_secs),
        ..PipelineConfig::default()
    };

    eprintln!("📨 SMS Ingest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", db_path);
    eprintln!("   Catch-up every {}s", catchup_interval_secs);
    eprintln!("   One JSON delivery per stdin line. Ctrl-D to exit.\n");

    // ── Store ───────────────────────────────────────────────────────────
    let store = Arc::new(LibSqlBackend::new_local(std::path::Path::new(&db_path)).await?);
    let messages: Arc<dyn MessageStore> = store.clone();
    let conversations: Arc<dyn ConversationStore> = store.clone();

    // ── Policy ──────────────────────────────────────────────────────────
    let blocking = Arc::new(AddressListEvaluator::new(
        env_list("SMS_INGEST_BLOCKLIST"),
        env_list("SMS_INGEST_UNBLOCKLIST"),
    ));
    let filter_patterns = env_list("SMS_INGEST_FILTER_PATTERNS");
    let filter = Arc::new(RegexContentFilter::from_body_patterns(
        filter_patterns.iter().map(String::as_str),
    ));
    let prefs = Arc::new(StaticPrefs::new(PrefsSnapshot {
        drop_blocked,
        blocking_manager: 0,
        unread_at_top,
    }));

    // ── Pipeline + scheduler ────────────────────────────────────────────
    let badge = Arc::new(LoggingBadge);
    let persist = PersistStage::new(messages.clone());
    let process = ProcessStage::new(ProcessDeps {
        messages: messages.clone(),
        conversations: conversations.clone(),
        blocking,
        filter,
        contacts: Arc::new(NoContacts),
        notifications: Arc::new(LoggingNotifications),
        shortcuts: Arc::new(LoggingShortcuts),
        badge: badge.clone(),
        prefs: prefs.clone(),
    });
    let catchup = CatchUpJob::new(
        CatchUpDeps {
            messages,
            conversations,
            sync: Arc::new(NullSyncService::new()),
            badge,
            prefs,
        },
        config.clone(),
    );

    let pipeline = Arc::new(Pipeline::new(persist, process, catchup));
    let scheduler = JobScheduler::new(pipeline, &config);

    let catchup_loop = spawn_catchup_loop(
        scheduler.clone(),
        config.catchup_interval,
        config.catchup_backoff_base,
    );

    // ── Stdin transport ─────────────────────────────────────────────────
    // Development stand-in for a real transport: one JSON SmsDelivery per
    // line, e.g. {"address":"+15551234567","fragments":["Hi"],"sent_at_ms":1700000000000}
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<SmsDelivery>(line) {
                    Ok(delivery) => {
                        receiver::handle_delivery(&scheduler, &config, delivery).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Unparseable delivery line");
                    }
                }
            }
            Ok(None) => break, // EOF
            Err(e) => {
                tracing::error!(error = %e, "Error reading stdin");
                break;
            }
        }
    }

    tracing::info!("Input closed, draining in-flight jobs");
    catchup_loop.abort();
    scheduler.drain().await;
    Ok(())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
