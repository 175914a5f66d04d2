use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::metrics;

const DASHBOARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards metric deltas to the analytics dashboard.
///
/// Delivery is best effort: a failed update is logged and counted but never
/// fails the event that produced it.
#[derive(Clone)]
pub struct DashboardClient {
    client: Client,
    url: String,
}

impl DashboardClient {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(DASHBOARD_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns whether the dashboard accepted the update.
    pub async fn publish(&self, update: &Value) -> bool {
        let result = self
            .client
            .post(&self.url)
            .json(update)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        match result {
            Ok(_) => {
                debug!(metric = ?update.get("metric"), "Dashboard updated");
                true
            }
            Err(e) => {
                metrics::DASHBOARD_UPDATE_FAILURES_TOTAL.inc();
                warn!(url = %self.url, error = %e, "Dashboard update failed");
                false
            }
        }
    }
}
