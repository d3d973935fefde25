//! Wall-clock stamping for outbound report payloads.

use chrono::{SecondsFormat, Utc};

/// RFC 3339 UTC timestamp carried by the `ready` and `stats` payloads so
/// upstream consumers can order reports across nodes with skewed queues.
pub fn report_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
