//! Listing catalog core: query building, pagination, lifecycle validation and
//! a resumable change feed over a document store.

pub mod changefeed;
pub mod config;
pub mod errors;
pub mod logger;
pub mod query;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;

pub use changefeed::{ChangeEvent, EventSink, OperationType, Subscriber, SubscriptionEnd, SubscriptionRequest};
pub use config::ServiceConfig;
pub use errors::{ErrorKind, ListingError};
pub use service::{ListingService, ListingSink};
pub use store::{DocumentStore, InMemoryStore, StoreError};
pub use types::Listing;
pub use validation::StandardStatus;

/// Loads configuration and initialises logging from it.
///
/// # Errors
/// Configuration errors, or a logger that cannot be built.
pub fn init(config_path: Option<&std::path::Path>) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    let cfg = ServiceConfig::load(config_path)?;
    logger::init(&cfg.log)?;
    Ok(cfg)
}
