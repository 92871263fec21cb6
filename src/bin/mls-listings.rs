use std::path::PathBuf;

use bson::{Bson, Document};
use clap::{Parser, Subcommand, ValueEnum};
use mls_listings::query::{
    AddressSearchRequest, BySourceRequest, CityRequest, FilterBuilder, ListingIdRequest, LookupRequest,
    OwnerSearchRequest, SoldListingsRequest, address_search, listing_id_search, match_stage, resolve,
    to_query_document,
};
use mls_listings::types::{ListingInput, UpdateListingRequest};
use mls_listings::validation::{validate_insert, validate_update};
use mls_listings::{Listing, ListingError, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "mls-listings", version, about = "Listing catalog operator CLI", long_about = None)]
struct Cli {
    /// Path to a config file (TOML)
    #[arg(long, help = "Path to a config file (TOML). Falls back to MLS_CONFIG, then ./mls-listings.toml.")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum QueryKind {
    ListingId,
    City,
    Lookup,
    Source,
    Sold,
    Owner,
    Address,
    Search,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(name = "check-config", about = "Validate the effective configuration and print it")]
    CheckConfig,
    #[command(name = "validate-insert", about = "Run insert rules against a listing JSON body")]
    ValidateInsert {
        #[arg(help = "Listing input as JSON")]
        json: String,
    },
    #[command(name = "validate-update", about = "Run update rules against an update body and the stored listing")]
    ValidateUpdate {
        #[arg(help = "Update request as JSON")]
        update_json: String,
        #[arg(help = "Stored listing as JSON")]
        prior_json: String,
    },
    #[command(name = "build-query", about = "Print the store query a read request compiles to")]
    BuildQuery {
        #[arg(value_enum, help = "Request kind")]
        kind: QueryKind,
        #[arg(help = "Request body as JSON")]
        json: String,
    },
}

fn parse<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, ListingError> {
    serde_json::from_str(json).map_err(|e| ListingError::InvalidArgument(format!("invalid JSON body: {e}")))
}

fn print_doc(doc: Document) {
    let value = Bson::Document(doc).into_relaxed_extjson();
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".into()));
}

fn build_query(cfg: &ServiceConfig, kind: QueryKind, json: &str) -> Result<(), ListingError> {
    let builder = FilterBuilder::new(cfg.api.by_source.allowed_last_change_days);
    let pagination = &cfg.api.pagination;
    let clauses = match kind {
        QueryKind::ListingId => builder.by_listing_id(&parse::<ListingIdRequest>(json)?)?,
        QueryKind::City => builder.by_city(&parse::<CityRequest>(json)?)?,
        QueryKind::Lookup => builder.by_lookup(&parse::<LookupRequest>(json)?)?,
        QueryKind::Source => builder.by_source(&parse::<BySourceRequest>(json)?)?,
        QueryKind::Sold => builder.sold_listings(&parse::<SoldListingsRequest>(json)?)?,
        QueryKind::Owner => builder.owner_listings(&parse::<OwnerSearchRequest>(json)?)?,
        QueryKind::Address => {
            let req: AddressSearchRequest = parse(json)?;
            for stage in address_search(&req, &cfg.api.by_address.search_index)? {
                print_doc(stage);
            }
            return Ok(());
        }
        QueryKind::Search => {
            let req: OwnerSearchRequest = parse(json)?;
            let q = req.q.as_deref().unwrap_or_default();
            let page = resolve(req.limit, req.offset, pagination);
            for stage in listing_id_search(q, &cfg.api.search.listing_id_index, page)? {
                print_doc(stage);
            }
            return Ok(());
        }
    };
    print_doc(to_query_document(&clauses));
    log::debug!("as a pipeline stage: {}", match_stage(&clauses));
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = mls_listings::init(cli.config.as_deref())?;
    match cli.command {
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        Commands::ValidateInsert { json } => {
            let input = validate_insert(parse::<ListingInput>(&json)?)?;
            println!("{}", serde_json::to_string_pretty(&input)?);
        }
        Commands::ValidateUpdate { update_json, prior_json } => {
            let req: UpdateListingRequest = parse(&update_json)?;
            let prior: Listing = parse(&prior_json)?;
            validate_update(&req, &prior)?;
            println!("ok");
        }
        Commands::BuildQuery { kind, json } => build_query(&cfg, kind, &json)?,
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
