use anyhow::{Result, bail};
use billsync_core::{ConnectionStatus, Credential};
use chrono::Utc;
use owo_colors::OwoColorize;

use super::{App, prompt_password, prompt_text};
use crate::provider::SUPPORTED;
use crate::render::{Render, pluralize};

pub struct ConnectArgs {
    pub account: Option<String>,
    pub calendar: Option<String>,
}

/// Prompt for credentials, store them and verify the connection.
pub async fn run(app: &App, provider: &str, args: ConnectArgs) -> Result<()> {
    let credential = match provider {
        billsync_provider_caldav::PROVIDER_NAME => caldav_credential(app, args)?,
        name if SUPPORTED.contains(&name) => oauth_credential(name, args)?,
        other => bail!(
            "Unknown provider '{}'. Available: {}",
            other,
            SUPPORTED.join(", ")
        ),
    };

    if !app.json {
        println!("Connecting to {provider}...");
    }
    let result = app.engine.connect_provider(provider, credential).await?;
    print_connection(app, &result)?;

    if result.status == ConnectionStatus::Connected
        && !app.engine.settings().is_provider_enabled(provider)
        && !app.json
    {
        println!(
            "{}",
            format!("Add \"{provider}\" to enabled_providers in settings.toml to start syncing")
                .yellow()
        );
    }
    Ok(())
}

pub async fn test(app: &App, provider: &str) -> Result<()> {
    let result = app.engine.test_connection(provider).await?;
    print_connection(app, &result)
}

pub async fn disconnect(app: &App, provider: &str) -> Result<()> {
    let purged = app.engine.disconnect_provider(provider).await?;
    if app.json {
        return app.print_json(&serde_json::json!({
            "provider": provider,
            "purged": purged,
        }));
    }
    println!(
        "{} Disconnected {} ({} queued {} discarded)",
        "✓".green(),
        provider,
        purged,
        pluralize("operation", purged)
    );
    Ok(())
}

fn print_connection(app: &App, result: &billsync_core::ConnectionResult) -> Result<()> {
    if app.json {
        return app.print_json(result);
    }
    println!("{}", result.render());
    Ok(())
}

/// Tokens obtained out of band (e.g. from the provider's OAuth playground).
/// An empty access token forces a refresh on first use.
fn oauth_credential(provider: &str, args: ConnectArgs) -> Result<Credential> {
    let account = match args.account {
        Some(account) => account,
        None => prompt_text("Account (e-mail)")?,
    };
    let access_token = prompt_password("Access token (leave empty to refresh)")?;
    let refresh_token = prompt_password("Refresh token")?;
    if access_token.is_empty() && refresh_token.is_empty() {
        bail!("{provider} needs an access token or a refresh token");
    }

    let mut credential = Credential::new(account, access_token.clone());
    if !refresh_token.is_empty() {
        credential.refresh_token = Some(refresh_token);
    }
    if access_token.is_empty() {
        credential.expires_at = Some(Utc::now());
    }
    if let Some(calendar) = args.calendar {
        credential.extra.insert("calendar_id".into(), calendar);
    }
    Ok(credential)
}

fn caldav_credential(app: &App, args: ConnectArgs) -> Result<Credential> {
    let configured = app.config.providers.caldav.as_ref();

    let username = match configured.and_then(|c| c.username.clone()) {
        Some(username) => username,
        None => prompt_text("Username")?,
    };
    let password = prompt_password("Password")?;
    let calendar_url = match args
        .calendar
        .or_else(|| configured.and_then(|c| c.calendar_url.clone()))
    {
        Some(url) => url,
        None => prompt_text("Calendar URL")?,
    };

    let account = args.account.unwrap_or_else(|| username.clone());
    let mut credential = Credential::new(account, password);
    credential.extra.insert("username".into(), username);
    credential.extra.insert("calendar_url".into(), calendar_url);
    Ok(credential)
}
