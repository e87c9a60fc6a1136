//! Integration tests: the engine wired against in-memory marketplaces.

mod mock_market;
mod pipeline;
