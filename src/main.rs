use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qrlink::cli;
use qrlink::config::{self, Config, LogFormat};
use qrlink::jobs;
use qrlink::middleware::audit::{AuditSink, MemoryAuditSink, PgAuditSink};
use qrlink::middleware::rbac::Actor;
use qrlink::models::token::{EntityRef, EntityType, Page};
use qrlink::registry::memory::StaticRegistry;
use qrlink::registry::postgres::PgEntityRegistry;
use qrlink::registry::EntityRegistry;
use qrlink::service::lifecycle::TokenSpec;
use qrlink::service::rules::RuleSpec;
use qrlink::service::{QrService, ServiceConfig};
use qrlink::store::memory::MemoryStore;
use qrlink::store::postgres::PgStore;
use qrlink::store::{RuleFilter, TokenStore};
use qrlink::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(cfg.log_format)?;

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port, memory }) => {
            run_server(cfg.clone(), port.unwrap_or(cfg.port), memory).await
        }
        Some(cli::Commands::Migrate) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Some(cli::Commands::Token { command }) => {
            let (service, _, audit) = pg_service(&cfg).await?;
            let result = handle_token_command(command, &service).await;
            audit.flush().await;
            result
        }
        Some(cli::Commands::Rule { command }) => {
            let (service, _, audit) = pg_service(&cfg).await?;
            let result = handle_rule_command(command, &service).await;
            audit.flush().await;
            result
        }
        None => run_server(cfg.clone(), cfg.port, false).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// EnvFilter + fmt (text or JSON), plus an OTLP exporter when
/// OTEL_EXPORTER_OTLP_ENDPOINT is set.
fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "qrlink"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "qrlink=debug,tower_http=debug".into()),
    );

    let (text_layer, json_layer) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(telemetry_layer)
        .init();
    Ok(())
}

fn service_config(cfg: &Config) -> ServiceConfig {
    ServiceConfig {
        public_base_url: cfg.public_base_url.clone(),
        rule_cache_ttl_secs: cfg.rule_cache_ttl_secs,
    }
}

async fn pg_service(cfg: &Config) -> anyhow::Result<(QrService, PgStore, PgAuditSink)> {
    let db = PgStore::connect(&cfg.database_url).await?;
    let store: Arc<dyn TokenStore> = Arc::new(db.clone());
    let registry: Arc<dyn EntityRegistry> = Arc::new(PgEntityRegistry::new(db.pool().clone()));
    let sink = PgAuditSink::new(db.pool().clone());
    let audit: Arc<dyn AuditSink> = Arc::new(sink.clone());
    Ok((QrService::new(store, registry, audit, service_config(cfg)), db, sink))
}

/// Development mode: everything in memory, seeded with a tiny catalog.
fn memory_service(cfg: &Config) -> QrService {
    let registry = StaticRegistry::new();
    registry
        .add_product("SKU-1", "Demo product")
        .add_batch("LOT-1", "SKU-1", "Demo lot 1")
        .add_batch("LOT-2", "SKU-1", "Demo lot 2");
    QrService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(registry),
        Arc::new(MemoryAuditSink::new()),
        service_config(cfg),
    )
}

async fn run_server(cfg: Config, port: u16, memory: bool) -> anyhow::Result<()> {
    let (service, db, audit) = if memory {
        tracing::warn!("running with in-memory storage; data is lost on exit");
        (memory_service(&cfg), None, None)
    } else {
        tracing::info!("Connecting to database...");
        let (service, db, audit) = pg_service(&cfg).await?;
        tracing::info!("Running migrations...");
        db.migrate().await?;
        (service, Some(db), Some(audit))
    };

    jobs::expiry::spawn(
        service.store().clone(),
        service.rules.cache().clone(),
        cfg.expiry_sweep_secs,
    );

    let state = AppState::new(service, cfg, db);
    let app = qrlink::build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("qrlink listening on {}", addr);
    let served = axum::serve(listener, app).await;
    if let Some(audit) = audit {
        audit.flush().await;
    }
    served?;

    Ok(())
}

fn parse_entity(entity_type: &str, entity_id: String) -> anyhow::Result<EntityRef> {
    let entity_type: EntityType = entity_type.parse().map_err(anyhow::Error::msg)?;
    Ok(EntityRef::new(entity_type, entity_id))
}

async fn handle_token_command(cmd: cli::TokenCommands, service: &QrService) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Create {
            entity_type,
            entity_id,
            version_id,
            expires_at,
            actor,
        } => {
            let mut spec = TokenSpec::new(parse_entity(&entity_type, entity_id)?);
            if let Some(v) = version_id {
                spec = spec.with_version(v);
            }
            if let Some(raw) = expires_at {
                let at = chrono::DateTime::parse_from_rfc3339(&raw)
                    .context("expires_at must be an RFC 3339 timestamp")?;
                spec = spec.expiring_at(at.with_timezone(&chrono::Utc));
            }
            let token = service.lifecycle.create_token(spec, &Actor::admin(actor)).await?;
            println!(
                "Token created:\n  ID:     {}\n  Value:  {}\n  Entity: {}",
                token.id,
                token.value,
                token.entity()
            );
        }
        cli::TokenCommands::Batch {
            entity_type,
            entity_id,
            quantity,
            version_id,
            actor,
        } => {
            let mut spec = TokenSpec::new(parse_entity(&entity_type, entity_id)?);
            if let Some(v) = version_id {
                spec = spec.with_version(v);
            }
            let tokens = service
                .lifecycle
                .create_token_batch(spec, quantity, &Actor::admin(actor))
                .await?;
            println!("{:<38} VALUE", "ID");
            for t in &tokens {
                println!("{:<38} {}", t.id, t.value);
            }
            println!("{} tokens created.", tokens.len());
        }
        cli::TokenCommands::Show { token } => {
            let id = match uuid::Uuid::parse_str(&token) {
                Ok(id) => id,
                Err(_) => {
                    service
                        .association
                        .lookup_token(&token, None, &Actor::viewer("cli"))
                        .await?
                        .token
                        .id
                }
            };
            let detail = service.lifecycle.get_token_detail(id).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        cli::TokenCommands::Revoke {
            token_id,
            reason,
            actor,
        } => {
            let id = uuid::Uuid::parse_str(&token_id).context("Invalid token ID")?;
            let token = service
                .lifecycle
                .revoke_token(id, &reason, &Actor::admin(actor))
                .await?;
            println!("Token {} revoked.", token.value);
        }
    }
    Ok(())
}

async fn handle_rule_command(cmd: cli::RuleCommands, service: &QrService) -> anyhow::Result<()> {
    match cmd {
        cli::RuleCommands::List {
            entity_type,
            entity_id,
            all,
        } => {
            let scope = match (entity_type, entity_id) {
                (Some(t), Some(id)) => Some(parse_entity(&t, id)?),
                (None, None) => None,
                _ => anyhow::bail!("--entity-type and --entity-id must be given together"),
            };
            let filter = RuleFilter {
                scope,
                active_only: !all,
                fallback_only: false,
            };
            let rules = service
                .rules
                .list_rules(&filter, Page::new(None, Some(Page::MAX_PER_PAGE)))
                .await?;
            if rules.is_empty() {
                println!("No rules found.");
            } else {
                println!("{:<38} {:<24} {:<8} URL", "ID", "SCOPE", "ACTIVE");
                for r in rules {
                    let scope = r
                        .scope()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "(fallback)".into());
                    println!("{:<38} {:<24} {:<8} {}", r.id, scope, r.active, r.redirect_url);
                }
            }
        }
        cli::RuleCommands::Deactivate { id, actor } => {
            let id = uuid::Uuid::parse_str(&id).context("Invalid rule ID")?;
            service.rules.deactivate_rule(id, &Actor::admin(actor)).await?;
            println!("Rule {} deactivated.", id);
        }
        cli::RuleCommands::SetFallback { url, reason, actor } => {
            let mut spec = RuleSpec::new(url);
            if let Some(r) = reason {
                spec = spec.with_reason(r);
            }
            let rule = service
                .rules
                .set_fallback_rule(&spec, &Actor::admin(actor))
                .await?;
            println!("Fallback set: {} ({})", rule.redirect_url, rule.id);
        }
    }
    Ok(())
}
