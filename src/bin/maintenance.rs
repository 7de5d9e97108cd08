use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;

use qrdocs::{
    auth::password,
    config::AppConfig,
    db,
    orgs::{self, OrganisationInput},
    reaper::Reaper,
    repo::PgRepository,
    storage::S3Storage,
};

const USAGE: &str = "Usage:
  maintenance create-org <name> <slug> <admin-password> <access-code>
  maintenance rotate-secrets <slug> [--admin-password P] [--access-code C]
  maintenance hash-secret <secret>
  maintenance sweep-orphans [max-age-minutes]";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    match command.as_str() {
        "create-org" => create_org(rest)?,
        "rotate-secrets" => rotate_secrets(rest)?,
        "hash-secret" => hash_secret(rest)?,
        "sweep-orphans" => sweep_orphans(rest).await?,
        other => {
            eprintln!("Unknown command: {other}\n{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn connect(config: &AppConfig) -> Result<Arc<PgRepository>> {
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    db::run_migrations(&pool)?;
    Ok(Arc::new(PgRepository::new(pool)))
}

fn create_org(args: &[String]) -> Result<()> {
    let [name, slug, admin_password, access_code] = args else {
        bail!("create-org expects <name> <slug> <admin-password> <access-code>\n{USAGE}");
    };

    let config = AppConfig::from_env()?;
    let repo = connect(&config)?;
    let org = orgs::create_organisation(
        repo.as_ref(),
        &config,
        OrganisationInput {
            name: name.clone(),
            slug: slug.clone(),
            admin_password: admin_password.clone(),
            access_code: access_code.clone(),
        },
    )
    .context("failed to create organisation")?;

    println!("Created organisation {} ({}) id={}", org.name, org.slug, org.id);
    Ok(())
}

fn rotate_secrets(args: &[String]) -> Result<()> {
    let Some((slug, flags)) = args.split_first() else {
        bail!("rotate-secrets expects <slug>\n{USAGE}");
    };

    let mut admin_password = None;
    let mut access_code = None;
    let mut flags = flags.iter();
    while let Some(flag) = flags.next() {
        let value = flags
            .next()
            .with_context(|| format!("{flag} expects a value"))?;
        match flag.as_str() {
            "--admin-password" => admin_password = Some(value.as_str()),
            "--access-code" => access_code = Some(value.as_str()),
            other => bail!("unknown flag {other}\n{USAGE}"),
        }
    }

    let config = AppConfig::from_env()?;
    let repo = connect(&config)?;
    let org = orgs::rotate_secrets(repo.as_ref(), slug, admin_password, access_code)
        .context("failed to rotate secrets")?;

    println!("Rotated secrets for {}", org.slug);
    Ok(())
}

fn hash_secret(args: &[String]) -> Result<()> {
    let [secret] = args else {
        bail!("hash-secret expects <secret>\n{USAGE}");
    };
    println!("{}", password::hash_secret(secret)?);
    Ok(())
}

async fn sweep_orphans(args: &[String]) -> Result<()> {
    let config = AppConfig::from_env()?;
    let minutes = match args.first() {
        Some(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("invalid max age {raw}"))?,
        None => config.orphan_max_age_minutes,
    };

    let repo = connect(&config)?;
    let storage = Arc::new(S3Storage::from_config(&config).await?);
    let reaper = Reaper::new(repo, storage);

    let report = reaper.sweep(ChronoDuration::minutes(minutes)).await?;
    println!(
        "Found {} orphaned documents, deleted {}.",
        report.found, report.deleted
    );
    for error in &report.errors {
        eprintln!("  {error}");
    }
    Ok(())
}
