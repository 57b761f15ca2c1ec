mod cli;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use report_embed_core::catalog::Catalog;
use report_embed_core::config::EmbedSettings;
use report_embed_core::telemetry::logging;
use report_embed_core::token::{ReqwestTokenProvider, TokenEndpointConfig, TokenProvider};
use report_embed_core::url_check;
use serde::Serialize;
use time::OffsetDateTime;

use cli::{Cli, Command};

/// Characters of the token kept in diagnostics output.
const TOKEN_PREVIEW_CHARS: usize = 8;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenDiagnostics {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    report: String,
    dataset: String,
    token_status: &'static str,
    token_preview: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
    url_status: &'static str,
    embed_url: Option<String>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;
    let settings = EmbedSettings::from_env().context("invalid REPORT_EMBED_* settings")?;

    match cli.command {
        Command::CheckUrl { url, host_suffix } => {
            let suffix = host_suffix.unwrap_or_else(|| settings.expected_host_suffix.clone());
            let validation = url_check::validate_with_host(&url, &suffix);
            println!("{}", serde_json::to_string_pretty(&validation)?);
            if !validation.valid {
                std::process::exit(1);
            }
        }
        Command::FetchToken {
            report,
            dataset,
            endpoint,
        } => {
            let diagnostics = fetch_token(&settings, endpoint, report, dataset).await?;
            println!("{}", serde_json::to_string_pretty(&diagnostics)?);
            if !diagnostics.errors.is_empty() {
                std::process::exit(1);
            }
        }
        Command::Catalog { file, user, json } => {
            let catalog = Catalog::load(&file)
                .with_context(|| format!("failed to load catalog {}", file.display()))?;
            let categories = match user.as_deref() {
                Some(user) => catalog.visible_to(user),
                None => catalog.categories.clone(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&categories)?);
                return Ok(());
            }
            if categories.is_empty() {
                println!("No dashboards available.");
            }
            for category in categories {
                println!("{} ({})", category.name, category.id);
                for entry in &category.dashboards {
                    println!("  [{}] {} report={}", entry.id, entry.title, entry.report_id);
                    let diagnostics = entry.descriptor().diagnose();
                    for error in &diagnostics.errors {
                        println!("    error: {error}");
                    }
                    for warning in &diagnostics.warnings {
                        println!("    warning: {warning}");
                    }
                }
            }
        }
    }
    Ok(())
}

async fn fetch_token(
    settings: &EmbedSettings,
    endpoint: Option<String>,
    report: String,
    dataset: String,
) -> Result<TokenDiagnostics> {
    let base = endpoint
        .or_else(|| settings.token_base_url.clone())
        .ok_or_else(|| anyhow!("no token endpoint; pass --endpoint or set REPORT_EMBED_TOKEN_BASE"))?;
    let config = TokenEndpointConfig::new(&base)?
        .with_bearer_token(settings.token_bearer.clone())
        .with_timeout(settings.fetch_timeout);
    let provider = ReqwestTokenProvider::new(config)?;

    let mut diagnostics = TokenDiagnostics {
        timestamp: OffsetDateTime::now_utc(),
        report,
        dataset,
        token_status: "failed",
        token_preview: None,
        expires_at: None,
        url_status: "unchecked",
        embed_url: None,
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    let grant = match provider
        .fetch_token(&diagnostics.report, &diagnostics.dataset)
        .await
    {
        Ok(grant) => grant,
        Err(err) => {
            tracing::warn!(report = %diagnostics.report, error = %err, "token fetch failed");
            diagnostics.errors.push(err.to_string());
            return Ok(diagnostics);
        }
    };

    let token = grant.into_cached(diagnostics.timestamp);
    diagnostics.token_status = "ok";
    diagnostics.token_preview = Some(redact(&token.token));
    diagnostics.expires_at = Some(token.expires_at);

    let validation = url_check::validate_with_host(&token.embed_url, &settings.expected_host_suffix);
    diagnostics.url_status = if validation.valid { "valid" } else { "invalid" };
    diagnostics.errors.extend(validation.reasons);
    diagnostics.warnings.extend(validation.warnings);
    diagnostics.embed_url = Some(token.embed_url);
    Ok(diagnostics)
}

fn redact(token: &str) -> String {
    let preview: String = token.chars().take(TOKEN_PREVIEW_CHARS).collect();
    format!("{preview}…")
}
