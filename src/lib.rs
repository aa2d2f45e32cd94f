//! Driver core for openGauss and PostgreSQL: the wire-protocol engine, the
//! connector lifecycle, connection pooling and the multiplexed command
//! scheduler.

pub mod auth;
pub mod cancellation;
pub mod clock;
pub mod config;
pub mod connector;
pub mod errors;
pub mod messages;
mod multiplex;
pub mod pool;
pub mod stats;
pub mod types;

pub use cancellation::CancelToken;
pub use config::{Options, SslMode, TargetSessionAttrs};
pub use connector::{Connector, ConnectorState, QueryResult, ResultStream};
pub use errors::Error;
pub use pool::{Pool, PooledConnector};
pub use types::{Interval, Lsn};

/// Parse a connection string and return its process-wide pool, creating it
/// on first use.
pub fn open_pool(connection_string: &str) -> Result<Pool, Error> {
    let options = Options::parse(connection_string)?;
    Ok(pool::get_or_create(options))
}

/// Format chrono::Duration to be more human-friendly.
///
/// # Arguments
///
/// * `duration` - A duration of time
pub fn format_duration(duration: &chrono::Duration) -> String {
    let milliseconds = format!("{:0>3}", duration.num_milliseconds() % 1000);

    let seconds = format!("{:0>2}", duration.num_seconds() % 60);

    let minutes = format!("{:0>2}", duration.num_minutes() % 60);

    let hours = format!("{:0>2}", duration.num_hours() % 24);

    let days = duration.num_days().to_string();

    format!("{days}d {hours}:{minutes}:{seconds}.{milliseconds}")
}
