use std::collections::HashMap;
use std::time::Duration;

/// The overall or per-check health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The component is operating normally.
    Healthy,
    /// The component is operating, but in a degraded state worth noting.
    Degraded,
    /// The component is not operating correctly.
    Unhealthy,
}

impl HealthStatus {
    /// Combines two statuses, taking the worse of the two.
    pub fn combine(self, other: Self) -> Self {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

/// The captured detail of an exception surfaced by a health check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthException {
    /// The exception's message.
    pub message: String,
    /// The exception's type name.
    pub type_name: String,
    /// An optional captured stack trace or backtrace rendering.
    pub stack_trace: Option<String>,
}

/// A single named check's contribution to a [`HealthReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthEntry {
    /// This check's own status.
    pub status: HealthStatus,
    /// A short human-readable description.
    pub description: String,
    /// How long the check took to run.
    pub duration: Duration,
    /// Arbitrary structured data the check wants to surface.
    pub data: HashMap<String, String>,
    /// Free-form tags for filtering/grouping in a health dashboard.
    pub tags: Vec<String>,
    /// The exception that caused a non-healthy status, if any.
    pub exception: Option<HealthException>,
}

impl HealthEntry {
    /// Builds a minimal healthy entry with no extra detail.
    pub fn healthy(description: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            description: description.into(),
            duration,
            data: HashMap::new(),
            tags: Vec::new(),
            exception: None,
        }
    }

    /// Builds a minimal unhealthy entry carrying the given exception detail.
    pub fn unhealthy(
        description: impl Into<String>,
        duration: Duration,
        exception: HealthException,
    ) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            description: description.into(),
            duration,
            data: HashMap::new(),
            tags: Vec::new(),
            exception: Some(exception),
        }
    }
}

/// The full health status document: an overall status plus a per-check
/// breakdown. Serialization is left to the caller's own health endpoint;
/// this crate provides only the types.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// The combined status across every entry.
    pub status: HealthStatus,
    /// Milliseconds since the registry's own epoch at which this report was
    /// produced.
    pub timestamp_ms: u64,
    /// How long it took to collect every entry.
    pub total_duration: Duration,
    /// Per-check detail, keyed by check name.
    pub entries: HashMap<String, HealthEntry>,
}

/// A single name+status+description row, for callers that want a simple
/// listing instead of the full [`HealthReport`] detail.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckSummary {
    /// The check's name.
    pub name: String,
    /// The check's status.
    pub status: HealthStatus,
    /// A short human-readable description.
    pub description: String,
}

impl HealthReport {
    /// Reduces this report to the simple name+status+description listing.
    pub fn to_summaries(&self) -> Vec<HealthCheckSummary> {
        self.entries
            .iter()
            .map(|(name, entry)| HealthCheckSummary {
                name: name.clone(),
                status: entry.status,
                description: entry.description.clone(),
            })
            .collect()
    }
}

/// A small in-process registry that resilience components (circuit breaker,
/// bulkhead, dedup cache, …) report their health into. A caller's own health
/// endpoint collects a [`HealthReport`] by calling [`collect`](Self::collect).
pub struct HealthRegistry {
    entries: parking_lot::Mutex<HashMap<String, HealthEntry>>,
    epoch: std::time::Instant,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
            epoch: std::time::Instant::now(),
        }
    }
}

impl HealthRegistry {
    /// Builds an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (overwriting) the current health entry for a named check.
    pub fn report(&self, name: impl Into<String>, entry: HealthEntry) {
        self.entries.lock().insert(name.into(), entry);
    }

    /// Removes a named check's entry, e.g. when a component is disposed.
    pub fn remove(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    /// Collects every registered entry into a combined [`HealthReport`].
    pub fn collect(&self) -> HealthReport {
        let start = std::time::Instant::now();
        let entries = self.entries.lock().clone();
        let status = entries
            .values()
            .fold(HealthStatus::Healthy, |acc, entry| acc.combine(entry.status));

        HealthReport {
            status,
            timestamp_ms: self.epoch.elapsed().as_millis() as u64,
            total_duration: start.elapsed(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_registry_reports_healthy() {
        // Given
        let registry = HealthRegistry::new();

        // When
        let report = registry.collect();

        // Then
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.entries.is_empty());
    }

    #[test]
    fn worst_entry_status_wins_the_combined_status() {
        // Given
        let registry = HealthRegistry::new();
        registry.report("dedup", HealthEntry::healthy("ok", Duration::from_millis(1)));
        registry.report(
            "circuit-breaker",
            HealthEntry::unhealthy(
                "open",
                Duration::from_millis(1),
                HealthException {
                    message: "breaker open".to_string(),
                    type_name: "CircuitOpen".to_string(),
                    stack_trace: None,
                },
            ),
        );

        // When
        let report = registry.collect();

        // Then
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.entries.len(), 2);
    }

    #[test]
    fn removed_entry_no_longer_contributes() {
        // Given
        let registry = HealthRegistry::new();
        registry.report(
            "bulkhead",
            HealthEntry::unhealthy(
                "saturated",
                Duration::from_millis(1),
                HealthException {
                    message: "rejected".to_string(),
                    type_name: "BulkheadRejected".to_string(),
                    stack_trace: None,
                },
            ),
        );

        // When
        registry.remove("bulkhead");

        // Then
        assert_eq!(registry.collect().status, HealthStatus::Healthy);
    }
}
