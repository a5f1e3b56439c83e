//! Integration tests for rowpipe.
//!
//! Tests in `postgres_test` require a running PostgreSQL database.
//! Set DATABASE_URL environment variable to run them.

pub mod command_test;
pub mod postgres_test;
pub mod projection_test;
pub mod streaming_test;
