use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use outreach::attachments::{AttachmentPackager, FileUpload, LocalAttachmentStore};
use outreach::config::AppConfig;
use outreach::dispatch::{
    DispatchScheduler, MailSender, OutboxDelivery, ScheduleOptions, SmtpMailer,
    spawn_due_dispatch_task,
};
use outreach::generation::{BatchOrchestrator, GenerationParams, HttpGenerator};
use outreach::progress::ProgressReporter;
use outreach::progress::ws::progress_routes;
use outreach::recipients::{Recipient, parse_manual_addresses};
use outreach::session::{DispatchRequest, OutreachSession};
use outreach::store::{LibSqlStore, OutreachStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    eprintln!("📨 Outreach v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Generator: {}", config.generator.endpoint);
    eprintln!("   Batch size: {}", config.pipeline.batch_size);
    eprintln!(
        "   Progress WS: ws://0.0.0.0:{}/ws/progress",
        config.progress_port
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Progress server ─────────────────────────────────────────────────
    let reporter = Arc::new(ProgressReporter::new());
    let app = progress_routes(Arc::clone(&reporter));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.progress_port))
        .await
        .with_context(|| format!("Failed to bind progress port {}", config.progress_port))?;
    tokio::spawn(async move {
        tracing::info!("Progress server started");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Progress server stopped");
        }
    });

    // ── Pipeline ────────────────────────────────────────────────────────
    let generator = Arc::new(HttpGenerator::new(config.generator.clone())?);
    let mut orchestrator = BatchOrchestrator::new(
        generator.clone(),
        Arc::clone(&reporter),
        config.pipeline.clone(),
    );
    if generator.supports_enrichment() {
        orchestrator = orchestrator.with_enricher(generator.clone());
    }

    let mailer: Option<Arc<dyn MailSender>> = config
        .mail
        .clone()
        .map(|mail| Arc::new(SmtpMailer::new(mail)) as Arc<dyn MailSender>);
    let delivery_mailer: Arc<dyn MailSender> = match &mailer {
        Some(mailer) => Arc::clone(mailer),
        None => Arc::new(DisabledMailer),
    };
    let outreach_store: Arc<dyn OutreachStore> = store.clone();
    let scheduler = DispatchScheduler::new(
        Arc::new(OutboxDelivery::new(delivery_mailer, Arc::clone(&outreach_store))),
        Arc::clone(&reporter),
        config.pipeline.clone(),
    );
    let packager = AttachmentPackager::new(
        Arc::new(LocalAttachmentStore::new(&config.attachment_dir)),
        config.pipeline.max_attachment_bytes,
    );
    let mut session = OutreachSession::new(orchestrator, scheduler, packager);

    // ── Recipients ──────────────────────────────────────────────────────
    let manual = match &config.run.manual_file {
        Some(path) => load_manual_recipients(path).await?,
        None => Vec::new(),
    };
    let skipped = session.load_recipients(store.as_ref(), manual).await?;
    eprintln!(
        "   Recipients: {} ({} skipped)",
        session.recipients().len(),
        skipped.len()
    );

    // ── Generate ────────────────────────────────────────────────────────
    let params = GenerationParams {
        template: config.run.template.clone(),
        profile: config.run.profile.clone(),
        options: None,
        enrich: config.run.enrich,
    };
    if !session.recipients().is_empty() {
        let run = session.generate(&params, config.run.force).await?;
        eprintln!("   Generation: {}", run.summary());
    }

    // ── Dispatch ────────────────────────────────────────────────────────
    let dispatchable = session
        .messages()
        .iter()
        .any(|m| m.success && session.recipients().contains(&m.recipient_id));
    if mailer.is_some() && dispatchable {
        let mut files = Vec::with_capacity(config.run.attachments.len());
        for path in &config.run.attachments {
            files.push(
                FileUpload::from_path(path)
                    .await
                    .with_context(|| format!("Failed to read attachment {}", path.display()))?,
            );
        }

        let request = match config.run.schedule_at {
            Some(at) => {
                let mut opts = ScheduleOptions::at(at);
                opts.notify_on_sent = config.run.notify_on_sent;
                DispatchRequest::scheduled(opts)
            }
            None => DispatchRequest::immediate(),
        }
        .with_files(files);

        let report = session.dispatch(request).await?;
        eprintln!("   Dispatch: {}", report.summary());
    } else if mailer.is_none() {
        eprintln!("   Dispatch: skipped (OUTREACH_SMTP_HOST not set)");
    }

    // ── Due-dispatch worker ─────────────────────────────────────────────
    if let Some(mailer) = mailer {
        let _due_handle =
            spawn_due_dispatch_task(mailer, outreach_store, config.due_check_interval);
        eprintln!(
            "   Due-dispatch worker: every {}s (Ctrl-C to exit)",
            config.due_check_interval.as_secs()
        );
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("OUTREACH_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

/// Read a JSON array of addresses. Invalid entries are reported and skipped.
async fn load_manual_recipients(path: &Path) -> anyhow::Result<Vec<Recipient>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let addresses: Vec<String> = serde_json::from_str(&raw)
        .with_context(|| format!("{} must be a JSON array of addresses", path.display()))?;
    let (recipients, rejected) = parse_manual_addresses(&addresses.join("\n"));
    for entry in rejected {
        tracing::warn!(entry = %entry, "Ignoring invalid manual address");
    }
    Ok(recipients)
}

/// Mailer used when SMTP is not configured. Every send fails.
struct DisabledMailer;

#[async_trait::async_trait]
impl MailSender for DisabledMailer {
    fn name(&self) -> &str {
        "disabled"
    }

    fn sender_address(&self) -> &str {
        ""
    }

    async fn send(
        &self,
        _envelope: &outreach::dispatch::Envelope,
    ) -> Result<(), outreach::error::DeliveryError> {
        Err(outreach::error::DeliveryError::SendFailed {
            name: "disabled".into(),
            reason: "SMTP is not configured".into(),
        })
    }
}
