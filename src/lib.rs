// tweetwatch: hybrid webhook + polling monitor for X/Twitter accounts.
//
// This is the library root. Each module corresponds to a stage or a
// collaborator of the ingestion pipeline.

pub mod analysis;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod media;
pub mod notify;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod rules;
pub mod status;
pub mod twitter;
pub mod web;
