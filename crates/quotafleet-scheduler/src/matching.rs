//! Request-to-worker label matching.

use quotafleet_core::LabelSet;

use crate::state::TaskRequest;

/// How well a request fits a worker, for requests that can run there at all.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Match {
    /// Whether the worker also satisfies the request's provisionable labels.
    pub provision_match: bool,
    /// Tie-break heuristic: the number of base labels on the request. More
    /// specific requests win the worker, reserving generically-labeled
    /// workers for generically-labeled requests.
    pub quality: usize,
}

/// Whether the request can run on a worker with these labels, and how good
/// the match is. Base labels are mandatory; provisionable labels only
/// grade the match.
pub(crate) fn compute_match(worker_labels: &LabelSet, request: &TaskRequest) -> Option<Match> {
    if !request.base_labels.is_subset(worker_labels) {
        return None;
    }
    Some(Match {
        provision_match: request.provisionable_labels.is_subset(worker_labels),
        quality: request.base_labels.len(),
    })
}
