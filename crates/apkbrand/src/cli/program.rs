use crate::apk::preflight;
use crate::cli::clap_cli::{Cli, Commands};
use crate::config::Config;
use crate::error::BuildError;
use crate::pipeline::{Outcome, Pipeline};
use crate::publisher::Publisher;
use anyhow::Context;
use apkbrand_request::{BuildRequest, CredentialPayload, LogoSource, generate_build_id};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub async fn program(argv: Cli) -> anyhow::Result<()> {
    let config = Config::load(argv.config.as_deref())?;

    match argv.command {
        Commands::Check => check(&config),

        Commands::Sweep => {
            let removed = Publisher::new(&config).sweep_expired().await?;
            println!("Removed {removed} expired artifact(s)");
            Ok(())
        }

        Commands::Build {
            name,
            package,
            logo_url,
            logo_file,
            user_id,
            token,
            build_id,
            json,
        } => {
            let logo = match (logo_url, logo_file) {
                (Some(url), _) => Some(LogoSource::Url(url)),
                (None, Some(path)) => Some(logo_from_file(&path).await?),
                (None, None) => None,
            };
            let build_id = build_id.unwrap_or_else(generate_build_id);
            let request = BuildRequest {
                build_id: Some(build_id.clone()),
                app_name: name,
                package_name: package.map(|p| p.to_string()),
                logo,
                credentials: CredentialPayload { user_id, token },
                cancel: false,
            };

            let pipeline = Arc::new(Pipeline::new(config)?);
            sweep_on_start(&pipeline).await;

            let mut task = tokio::spawn({
                let pipeline = pipeline.clone();
                async move { pipeline.handle(request).await }
            });

            let result = tokio::select! {
                joined = &mut task => joined?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, cancelling build {build_id}");
                    pipeline.cancel(&build_id);
                    task.await?
                }
            };

            if !report(&result, json)? {
                anyhow::bail!("build {build_id} did not complete");
            }
            Ok(())
        }

        Commands::Batch { requests, json } => {
            let raw = tokio::fs::read_to_string(&requests)
                .await
                .with_context(|| format!("Failed to read {}", requests.display()))?;
            let requests: Vec<BuildRequest> = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", requests.display()))?;

            let pipeline = Arc::new(Pipeline::new(config)?);
            sweep_on_start(&pipeline).await;

            let total = requests.len();
            info!(total, "running batch");

            let mut set = JoinSet::new();
            for (index, request) in requests.into_iter().enumerate() {
                let pipeline = pipeline.clone();
                set.spawn(async move { (index, pipeline.handle(request).await) });
            }

            let mut results = Vec::with_capacity(total);
            while let Some(joined) = set.join_next().await {
                results.push(joined?);
            }
            results.sort_by_key(|(index, _)| *index);

            let mut failed = 0;
            for (_, result) in &results {
                if !report(result, json)? {
                    failed += 1;
                }
            }

            if failed > 0 {
                anyhow::bail!("{failed} of {total} requests failed");
            }
            Ok(())
        }
    }
}

/// Prints one outcome. Returns whether it counts as a success.
fn report(result: &Result<Outcome, BuildError>, json: bool) -> anyhow::Result<bool> {
    if json {
        let rendered = match result {
            Ok(outcome) => serde_json::to_string(outcome)?,
            Err(err) => serde_json::to_string(&err.to_failure())?,
        };
        println!("{rendered}");
        return Ok(result.is_ok());
    }

    match result {
        Ok(Outcome::Published { build_id, path, artifact }) => {
            println!("{build_id}: published {path} ({})", artifact.path.display());
        }
        Ok(Outcome::Cancelled { build_id, found }) => {
            let state = if *found { "cancelled" } else { "was not running" };
            println!("{build_id}: {state}");
        }
        Err(err) => eprintln!("[{}] {}", err.code(), err.diagnostic()),
    }

    Ok(result.is_ok())
}

fn check(config: &Config) -> anyhow::Result<()> {
    let mut problems = 0;

    for status in preflight(&config.tools) {
        match &status.resolved {
            Some(path) => println!("✓ {:<10} {}", status.label, path.display()),
            None => {
                problems += 1;
                println!("✗ {:<10} not found ({})", status.label, status.configured.display());
            }
        }
    }

    if config.base_apk.is_file() {
        println!("✓ {:<10} {}", "base apk", config.base_apk.display());
    } else {
        problems += 1;
        println!("✗ {:<10} missing ({})", "base apk", config.base_apk.display());
    }

    let keystore = config.keystore.path();
    if keystore.is_file() {
        println!("✓ {:<10} {}", "keystore", keystore.display());
    } else if config.keystore.generate_if_missing {
        println!("- {:<10} will be generated at {}", "keystore", keystore.display());
    } else {
        problems += 1;
        println!("✗ {:<10} missing ({})", "keystore", keystore.display());
    }

    if problems > 0 {
        anyhow::bail!("{problems} problem(s) found");
    }
    Ok(())
}

async fn sweep_on_start(pipeline: &Pipeline) {
    if let Err(err) = pipeline.publisher().sweep_expired().await {
        warn!(%err, "startup sweep failed");
    }
}

async fn logo_from_file(path: &Path) -> anyhow::Result<LogoSource> {
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => anyhow::bail!("Unsupported logo file type: {}", path.display()),
    };

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read logo {}", path.display()))?;

    Ok(LogoSource::DataUrl(format!(
        "data:{mime};base64,{}",
        STANDARD.encode(bytes)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn logo_files_become_data_urls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Logo.JPG");
        std::fs::write(&path, b"abc").unwrap();

        let logo = logo_from_file(&path).await.unwrap();
        assert_eq!(logo, LogoSource::DataUrl("data:image/jpeg;base64,YWJj".to_string()));

        let svg = dir.path().join("logo.svg");
        std::fs::write(&svg, b"<svg/>").unwrap();
        assert!(logo_from_file(&svg).await.is_err());
    }

    #[test]
    fn failures_report_as_unsuccessful() {
        let err: Result<Outcome, BuildError> = Err(BuildError::Validation("bad".to_string()));
        assert!(!report(&err, true).unwrap());

        let cancelled = Ok(Outcome::Cancelled {
            build_id: "b".to_string(),
            found: false,
        });
        assert!(report(&cancelled, false).unwrap());
    }
}
