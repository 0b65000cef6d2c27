use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostgate::config::{self, Config, StoreBackend};
use hostgate::middleware::audit::AuditSigner;
use hostgate::models::approval::{ApprovalStatus, PageRequest, RequestFilter};
use hostgate::models::audit::{AuditAction, HistoryFilter};
use hostgate::store::memory::MemoryStore;
use hostgate::store::postgres::PgStore;
use hostgate::store::ApprovalStore;
use hostgate::workflow::ApprovalService;
use hostgate::{api, jobs, AppState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    init_tracing()?;

    let cfg = config::load()?;

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Approval { actor, command }) => {
            let service = build_service(&cfg, false).await?;
            handle_approval_command(&service, &actor, command).await
        }
        Some(cli::Commands::Policy { command }) => {
            let (policies, executors) = cfg.registries()?;
            match command {
                cli::PolicyCommands::List => {
                    println!(
                        "{:<20} {:<10} {:<10} {:<8} {:<9} DESCRIPTION",
                        "TYPE", "ROLE", "TTL", "AUTO", "EXECUTOR"
                    );
                    for p in policies.list() {
                        println!(
                            "{:<20} {:<10} {:<10} {:<8} {:<9} {}",
                            p.request_type,
                            p.required_role.as_ref().map(|r| r.as_str()).unwrap_or("-"),
                            format!("{}s", p.ttl().num_seconds()),
                            p.auto_execute,
                            executors.get(&p.request_type).is_some(),
                            p.description
                        );
                    }
                    Ok(())
                }
            }
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// fmt layer filtered by RUST_LOG, plus an OTLP exporter when
/// OTEL_EXPORTER_OTLP_ENDPOINT is set.
fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "hostgate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hostgate=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn build_service(cfg: &Config, migrate: bool) -> anyhow::Result<Arc<ApprovalService>> {
    let signer = AuditSigner::new(cfg.audit_secret()?)?;

    let store: Arc<dyn ApprovalStore> = match cfg.store {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            if migrate {
                tracing::info!("Running migrations...");
                db.migrate().await?;
            }
            Arc::new(db)
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; requests do not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let (policies, executors) = cfg.registries()?;
    tracing::info!(
        policies = policies.len(),
        executors = executors.len(),
        "loaded approval policies"
    );

    Ok(Arc::new(ApprovalService::new(
        store,
        Arc::new(policies),
        executors,
        signer,
    )))
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let service = build_service(&cfg, true).await?;

    let state = Arc::new(AppState {
        service: service.clone(),
        api_key: cfg.api_key.clone(),
    });
    if state.api_key.is_none() {
        tracing::warn!("HOSTGATE_API_KEY is not set; the API accepts unauthenticated calls");
    }

    let app = api::app(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware));

    if cfg.expiry_interval_secs > 0 {
        jobs::expiry::spawn(service, Duration::from_secs(cfg.expiry_interval_secs));
        tracing::info!(
            every_secs = cfg.expiry_interval_secs,
            "Background expiry job started"
        );
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("hostgate listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: injects security headers into every response.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");
    resp
}

fn parse_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("invalid request ID: {}", raw))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_approval_command(
    service: &ApprovalService,
    actor: &cli::ActorArgs,
    cmd: cli::ApprovalCommands,
) -> anyhow::Result<()> {
    let actor = actor.actor();
    match cmd {
        cli::ApprovalCommands::Create {
            request_type,
            payload,
            reason,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be JSON")?;
            let created = service
                .create_request(&actor, &request_type, payload, &reason)
                .await?;
            println!(
                "Request {} created ({}), expires {}",
                created.id, created.status, created.expires_at
            );
        }
        cli::ApprovalCommands::List {
            mine,
            request_type,
            status,
            page,
            per_page,
        } => {
            let filter = RequestFilter {
                request_type,
                status: status
                    .as_deref()
                    .map(str::parse::<ApprovalStatus>)
                    .transpose()
                    .map_err(anyhow::Error::msg)?,
                ..Default::default()
            };
            let page = PageRequest::new(Some(page), Some(per_page));
            let listed = if mine {
                service.list_my_requests(&actor.id, filter, page).await?
            } else {
                service.list_pending_requests(filter, page).await?
            };

            if listed.items.is_empty() {
                println!("No matching requests.");
                return Ok(());
            }

            println!(
                "{:<38} {:<18} {:<10} {:<12} EXPIRES",
                "ID", "TYPE", "STATUS", "REQUESTER"
            );
            for r in &listed.items {
                println!(
                    "{:<38} {:<18} {:<10} {:<12} {}",
                    r.id, r.request_type, r.status, r.requester_id, r.expires_at
                );
            }
            let p = &listed.pagination;
            println!(
                "page {}/{} ({} total, {} per page)",
                p.page, p.total_pages, p.total, p.per_page
            );
        }
        cli::ApprovalCommands::Show { request_id } => {
            let detail = service.get_request(parse_id(&request_id)?, &actor).await?;
            print_json(&detail)?;
        }
        cli::ApprovalCommands::Approve {
            request_id,
            comment,
        } => {
            let out = service
                .approve_request(parse_id(&request_id)?, &actor, comment.as_deref())
                .await?;
            println!("Request {} {}.", out.id, out.status);
            if let Some(report) = out.execution.filter(|r| !r.succeeded) {
                println!(
                    "Auto-execute failed: {}",
                    report.error.unwrap_or_default()
                );
            }
        }
        cli::ApprovalCommands::Reject {
            request_id,
            reason,
            emergency,
        } => {
            let out = service
                .reject_request(parse_id(&request_id)?, &actor, &reason, emergency)
                .await?;
            println!("Request {} {}.", out.id, out.status);
        }
        cli::ApprovalCommands::Cancel { request_id } => {
            let out = service.cancel_request(parse_id(&request_id)?, &actor).await?;
            println!("Request {} {}.", out.id, out.status);
        }
        cli::ApprovalCommands::Execute { request_id } => {
            let out = service.execute_request(parse_id(&request_id)?, &actor).await?;
            print_json(&out)?;
        }
        cli::ApprovalCommands::Expire => {
            let n = service.expire_old_requests().await?;
            println!("Expired {} request(s).", n);
        }
        cli::ApprovalCommands::History {
            request_id,
            actor: actor_id,
            action,
            page,
            per_page,
        } => {
            let filter = HistoryFilter {
                approval_request_id: request_id.as_deref().map(parse_id).transpose()?,
                actor_id,
                action: action
                    .as_deref()
                    .map(str::parse::<AuditAction>)
                    .transpose()
                    .map_err(anyhow::Error::msg)?,
                ..Default::default()
            };
            let history = service
                .get_approval_history(filter, PageRequest::new(Some(page), Some(per_page)))
                .await?;

            println!(
                "{:<32} {:<38} {:<10} {:<12} VALID",
                "TIMESTAMP", "REQUEST", "ACTION", "ACTOR"
            );
            for row in &history.items {
                println!(
                    "{:<32} {:<38} {:<10} {:<12} {}",
                    row.entry.timestamp,
                    row.entry.approval_request_id,
                    row.entry.action,
                    row.entry.actor_id,
                    if row.signature_valid { "yes" } else { "NO" }
                );
            }
        }
        cli::ApprovalCommands::Stats { period } => {
            print_json(&service.get_approval_stats(&period).await?)?;
        }
    }
    Ok(())
}
