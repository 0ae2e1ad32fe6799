use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use atelier_server::content::{PageDocument, PageId};
use atelier_server::gate::unix_now;
use atelier_server::license::{looks_like_hex, LicenseIssuer};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "atelier", about = "Atelier site server and admin tools", version)]
struct Cli {
    /// Atelier server URL (default: http://localhost:8080 or $ATELIER_SERVER)
    #[arg(long, env = "ATELIER_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Admin token or session token for write requests ($ATELIER_TOKEN)
    #[arg(long, env = "ATELIER_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Atelier HTTP server
    Serve {
        /// Port to listen on (default: $ATELIER_PORT or 8080)
        #[arg(long, env = "ATELIER_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $ATELIER_HOST or 0.0.0.0)
        #[arg(long, env = "ATELIER_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Create a single-use login link in the local state store
    MagicLink {
        /// Link lifetime e.g. 10m, 1h (minimum 60s)
        #[arg(long, default_value = "10m")]
        ttl: String,
        /// Public base URL of the site (default: --server)
        #[arg(long, env = "ATELIER_PUBLIC_URL")]
        base_url: Option<String>,
    },
    /// Offline license tooling
    License {
        #[command(subcommand)]
        command: LicenseCommands,
    },
    /// Download a content page as JSON
    Pull {
        /// Page id: index, contact, gallery, pricing, sauna, shop
        page: String,
        /// Output file (default: stdout)
        path: Option<PathBuf>,
    },
    /// Validate and upload a content page from a JSON file
    Push {
        /// Page id: index, contact, gallery, pricing, sauna, shop
        page: String,
        /// JSON file to upload
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum LicenseCommands {
    /// Sign a license for a device fingerprint
    Issue {
        /// Device fingerprint (SHA-256 hex expected)
        fingerprint: String,
        /// Validity in days; values below 1 fall back to 30
        #[arg(long, default_value_t = 30, allow_negative_numbers = true)]
        days: i64,
        /// Issuer private key, PKCS#8 or PKCS#1 PEM
        #[arg(long, env = "ATELIER_LICENSE_PRIVATE_KEY", default_value = "issuer_private.pem")]
        key: PathBuf,
    },
    /// Print the public key (SPKI PEM) for the server
    Pubout {
        #[arg(long, env = "ATELIER_LICENSE_PRIVATE_KEY", default_value = "issuer_private.pem")]
        key: PathBuf,
    },
    /// Generate a new issuer private key
    Keygen {
        #[arg(long, default_value = "issuer_private.pem")]
        out: PathBuf,
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ATELIER_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::MagicLink { ttl, base_url } => {
            let base = base_url.unwrap_or_else(|| cli.server.clone());
            cmd_magic_link(&base, &ttl)
        }

        Commands::License { command } => match command {
            LicenseCommands::Issue {
                fingerprint,
                days,
                key,
            } => cmd_license_issue(&fingerprint, days, &key),
            LicenseCommands::Pubout { key } => cmd_license_pubout(&key),
            LicenseCommands::Keygen { out, bits } => cmd_license_keygen(&out, bits),
        },

        Commands::Pull { page, path } => {
            cmd_pull(&cli.server, cli.token.as_deref(), &page, path.as_deref()).await
        }

        Commands::Push { page, path } => {
            let token = require_token(&cli.token)?;
            cmd_push(&cli.server, &token, &page, &path).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = atelier_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    atelier_server::run(cfg).await
}

fn cmd_magic_link(base: &str, ttl: &str) -> Result<()> {
    let ttl_secs = parse_duration(ttl)?;
    let cfg = atelier_server::ServerConfig::default();
    let data_dir = atelier_server::resolve_data_dir(cfg.data_dir.as_ref())?;
    let links = atelier_server::open_magic_links(cfg.state_backend, &data_dir)?;

    let token = links
        .create(unix_now(), i64::try_from(ttl_secs).unwrap_or(i64::MAX))
        .context("store magic link")?;
    info!(data_dir = %data_dir.display(), "magic link stored");
    println!("{}", magic_link_url(base, &token));
    Ok(())
}

fn cmd_license_issue(fingerprint: &str, days: i64, key: &Path) -> Result<()> {
    let fingerprint = fingerprint.trim();
    if fingerprint.is_empty() {
        anyhow::bail!("empty fingerprint");
    }
    if !looks_like_hex(fingerprint) {
        warn!("fingerprint contains non-hex characters");
    }
    let issuer = load_issuer(key)?;
    println!("{}", issuer.issue(fingerprint, days, unix_now()));
    Ok(())
}

fn cmd_license_pubout(key: &Path) -> Result<()> {
    let issuer = load_issuer(key)?;
    print!("{}", issuer.public_key_pem()?);
    Ok(())
}

fn cmd_license_keygen(out: &Path, bits: usize) -> Result<()> {
    if out.exists() {
        anyhow::bail!("{} already exists; refusing to overwrite", out.display());
    }
    let issuer = LicenseIssuer::generate(bits)?;
    std::fs::write(out, issuer.private_key_pem()?)
        .with_context(|| format!("write {}", out.display()))?;
    println!("✓ wrote {} ({bits}-bit RSA)", out.display());
    println!("copy the public key to the server:");
    print!("{}", issuer.public_key_pem()?);
    Ok(())
}

async fn cmd_pull(server: &str, token: Option<&str>, page: &str, path: Option<&Path>) -> Result<()> {
    let page = PageId::parse(page).map_err(|e| anyhow::anyhow!("{e}"))?;
    let client = Client::new();
    let mut req = client.get(format!("{}/content", server.trim_end_matches('/')))
        .query(&[("page", page.as_str())]);
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    let resp = req.send().await.context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {error}");
    }

    let pretty = serde_json::to_string_pretty(&json)? + "\n";
    match path {
        Some(path) => {
            std::fs::write(path, pretty).with_context(|| format!("write {}", path.display()))?;
            println!("wrote {page} to {}", path.display());
        }
        None => print!("{pretty}"),
    }
    Ok(())
}

async fn cmd_push(server: &str, token: &str, page: &str, path: &Path) -> Result<()> {
    let page = PageId::parse(page).map_err(|e| anyhow::anyhow!("{e}"))?;
    let body = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    // Same check the server applies; fail before the round trip.
    PageDocument::parse(page, &body).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;

    let client = Client::new();
    let resp = client
        .post(format!("{}/save_content", server.trim_end_matches('/')))
        .query(&[("page", page.as_str())])
        .bearer_auth(token)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    let message = json["message"].as_str().unwrap_or("");
    if !status.is_success() {
        anyhow::bail!("server returned {status}: {message}");
    }
    println!("✓ pushed {page}: {message}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn require_token(token: &Option<String>) -> Result<String> {
    token
        .clone()
        .context("--token / ATELIER_TOKEN is required for this command")
}

fn load_issuer(key: &Path) -> Result<LicenseIssuer> {
    let pem = std::fs::read_to_string(key)
        .with_context(|| format!("read private key {}", key.display()))?;
    LicenseIssuer::from_pem(&pem)
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn magic_link_url(base: &str, token: &str) -> String {
    format!("{}/gate?action=use_magic&token={token}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("10m").unwrap(), 600);
        assert_eq!(parse_duration("1h 30m").unwrap(), 5400);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn magic_link_url_strips_trailing_slash() {
        assert_eq!(
            magic_link_url("https://example.org/", "abc"),
            "https://example.org/gate?action=use_magic&token=abc"
        );
    }

    #[test]
    fn keygen_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("issuer.pem");
        std::fs::write(&out, "keep me").unwrap();
        assert!(cmd_license_keygen(&out, 1024).is_err());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "keep me");
    }

    #[test]
    fn pushing_an_unknown_page_fails_locally() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let err = rt
            .block_on(cmd_push("http://127.0.0.1:1", "t", "admin", Path::new("x.json")))
            .unwrap_err();
        assert!(err.to_string().contains("Invalid page"));
    }
}
