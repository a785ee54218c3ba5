use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;

use dexero::commands;
use dexero::models::{CredentialsUpdate, DateRange, InvoiceFilter, InvoiceStatus};
use dexero::{logging, AppConfig, AppState};

#[derive(Parser)]
#[command(name = "dexero", version, about = "Sync captured supplier invoices from Dext into Xero")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, validate and push one batch of invoices
    Sync {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// List stored invoices, newest first
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<InvoiceStatus>,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Print one stored invoice
    Show { id: String },
    /// Re-run validation for one invoice
    Validate { id: String },
    /// Push one validated invoice to Xero
    Push { id: String },
    /// Look for a matching bank transaction in Xero
    Verify { id: String },
    #[command(subcommand)]
    Settings(SettingsCommand),
    #[command(subcommand)]
    Xero(XeroCommand),
}

#[derive(clap::Args)]
struct RangeArgs {
    #[arg(long, value_parser = parse_date)]
    from: Option<NaiveDate>,
    #[arg(long, value_parser = parse_date)]
    to: Option<NaiveDate>,
}

impl From<RangeArgs> for DateRange {
    fn from(args: RangeArgs) -> Self {
        DateRange {
            start: args.from,
            end: args.to,
        }
    }
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Show stored credentials with secrets masked
    Show,
    /// Update credentials; omitted flags keep their stored value
    Set {
        #[arg(long)]
        dext_api_key: Option<String>,
        #[arg(long)]
        xero_client_id: Option<String>,
        #[arg(long)]
        xero_client_secret: Option<String>,
        #[arg(long)]
        openai_api_key: Option<String>,
        /// Service-account JSON for the vision API
        #[arg(long)]
        vision_credentials: Option<String>,
    },
}

#[derive(Subcommand)]
enum XeroCommand {
    /// Print the consent URL to start the OAuth flow
    AuthUrl,
    /// Exchange the authorization code from the redirect
    Callback { code: String },
    /// Refresh the access token if it has expired
    Refresh,
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn parse_status(value: &str) -> Result<InvoiceStatus, String> {
    InvoiceStatus::parse(&value.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown status `{}` (pending, validated, pushed, error)", value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    logging::init(&config.log_level);

    let state = AppState::open(&config)?;

    match cli.command {
        Command::Sync { range } => print_json(&commands::invoices::sync(&state, range.into()).await?),
        Command::List { status, range } => {
            let filter = InvoiceFilter {
                status,
                range: range.into(),
            };
            print_json(&commands::invoices::list(&state, &filter)?)
        }
        Command::Show { id } => print_json(&commands::invoices::show(&state, &id)?),
        Command::Validate { id } => print_json(&commands::invoices::validate(&state, &id).await?),
        Command::Push { id } => print_json(&commands::invoices::push(&state, &id).await?),
        Command::Verify { id } => print_json(&commands::invoices::verify(&state, &id).await?),
        Command::Settings(SettingsCommand::Show) => print_json(&commands::settings::get_settings(&state)?),
        Command::Settings(SettingsCommand::Set {
            dext_api_key,
            xero_client_id,
            xero_client_secret,
            openai_api_key,
            vision_credentials,
        }) => {
            let update = CredentialsUpdate {
                dext_api_key,
                xero_client_id,
                xero_client_secret,
                openai_api_key,
                vision_credentials,
            };
            if update.is_empty() {
                return Err(anyhow!("nothing to update, pass at least one credential flag"));
            }
            print_json(&commands::settings::save_settings(&state, update)?)
        }
        Command::Xero(XeroCommand::AuthUrl) => print_json(&commands::xero::auth_url(&state)?),
        Command::Xero(XeroCommand::Callback { code }) => print_json(&commands::xero::callback(&state, &code).await?),
        Command::Xero(XeroCommand::Refresh) => print_json(&commands::xero::refresh(&state).await?),
    }
}
