// Clause tree and store options
mod types;

// Submodules for separation of concerns
pub mod eval;
pub mod filters;
pub mod pagination;
pub mod render;
pub mod search;

pub use eval::{eval_all, eval_filter};
pub use filters::{
    AgentIdRequest, BySourceRequest, CityRequest, FilterBuilder, ListingFilter, ListingGuidRequest,
    ListingIdRequest, LookupField, LookupRequest, OwnerSearchRequest, SoldListingsRequest, common_filter, in_list,
    parse_date, split_list,
};
pub use pagination::{Page, PaginationConfig, resolve};
pub use render::{match_stage, render_filter, to_query_document};
pub use search::{AddressSearchRequest, SearchOperator, address_search, listing_id_search};
pub use types::{CmpOp, Filter, FindOptions, MAX_IN_SET, Pipeline};
