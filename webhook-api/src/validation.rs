//! `Register` input validation.
//!
//! All failures here are `WebhookError::BadRequest` and happen before any
//! persistence — the caller gets a clear 400, and no row or job is ever
//! written for invalid input.

use chrono::{DateTime, Duration, Utc};
use url::Url;
use webhook_common::carrier::CarrierRegistry;
use webhook_common::error::{Result, WebhookError};

pub const MAX_REGISTRATION_LIFETIME: Duration = Duration::days(30);

/// Coarse textual prefixes rejected in production. `"172."` is
/// deliberately kept as a bare prefix even though it over-rejects public
/// addresses like `172.217.x.x` rather than the narrower `172.16.0.0/12`
/// range — see DESIGN.md.
const PRIVATE_HOST_PREFIXES: [&str; 3] = ["10.", "172.", "192.168."];
const PRIVATE_HOSTNAMES: [&str; 2] = ["localhost", "127.0.0.1"];

pub struct RegisterInput<'a> {
    pub carrier_id: &'a str,
    pub tracking_number: &'a str,
    pub callback_url: &'a str,
    pub expiration_time: DateTime<Utc>,
}

/// Validates one `Register` call. `production` gates the private-host
/// rejection, matching `NODE_ENV=production` in the configuration.
pub fn validate_register_input(
    input: &RegisterInput<'_>,
    carriers: &CarrierRegistry,
    production: bool,
) -> Result<()> {
    if input.carrier_id.trim().is_empty() {
        return Err(WebhookError::BadRequest("carrierId must not be empty".into()));
    }
    if input.tracking_number.trim().is_empty() {
        return Err(WebhookError::BadRequest("trackingNumber must not be empty".into()));
    }

    let url = Url::parse(input.callback_url)
        .map_err(|e| WebhookError::BadRequest(format!("callbackUrl is not a valid URL: {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(WebhookError::BadRequest(
            "callbackUrl scheme must be http or https".into(),
        ));
    }

    if production {
        let host = url
            .host_str()
            .ok_or_else(|| WebhookError::BadRequest("callbackUrl must have a host".into()))?;
        if is_private_host(host) {
            return Err(WebhookError::BadRequest(format!(
                "callbackUrl host {host} is not allowed in production"
            )));
        }
    }

    let now = Utc::now();
    if input.expiration_time <= now {
        return Err(WebhookError::BadRequest("expirationTime must be in the future".into()));
    }
    if input.expiration_time > now + MAX_REGISTRATION_LIFETIME {
        return Err(WebhookError::BadRequest(
            "expirationTime must not exceed 30 days from now".into(),
        ));
    }

    if !carriers.contains(input.carrier_id) {
        return Err(WebhookError::BadRequest(format!(
            "unknown carrierId: {}",
            input.carrier_id
        )));
    }

    Ok(())
}

fn is_private_host(host: &str) -> bool {
    PRIVATE_HOSTNAMES.contains(&host) || PRIVATE_HOST_PREFIXES.iter().any(|prefix| host.starts_with(prefix))
}
