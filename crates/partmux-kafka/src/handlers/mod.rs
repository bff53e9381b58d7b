//! Request handlers
//!
//! One module per rewritten API. Handlers answer partition-level failures
//! inside their response; an `Err` is reserved for failures that affect the
//! whole request.

pub mod api_versions;
pub mod fetch;
pub mod find_coordinator;
pub mod list_offsets;
pub mod metadata;
pub mod offsets;
pub mod produce;
mod scan;

pub use api_versions::handle_api_versions;
pub use fetch::handle_fetch;
pub use find_coordinator::handle_find_coordinator;
pub use list_offsets::handle_list_offsets;
pub use metadata::handle_metadata;
pub use offsets::{handle_offset_commit, handle_offset_fetch};
pub use produce::handle_produce;
