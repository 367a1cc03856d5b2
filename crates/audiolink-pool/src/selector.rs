//! Pure node-selection policy.
//!
//! Selection runs over immutable [`NodeSnapshot`]s so the policy can be
//! tested without any live connection state. A strict region-constrained
//! filter is tried first; when it yields nothing, a relaxed pass keeps only
//! the capability and attempted-region constraints, so a working node is
//! still preferred over none.

use std::collections::HashSet;

use audiolink_common::NodeId;

/// Point-in-time view of one node, as consumed by the selection policy.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    /// Connected and accepting work.
    pub available: bool,
    /// Excluded from playback assignment.
    pub search_only: bool,
    pub region: Option<String>,
    /// Load score; lower is preferred.
    pub penalty: f64,
    pub capabilities: HashSet<String>,
}

impl NodeSnapshot {
    pub fn has_capability(&self, feature: &str) -> bool {
        self.capabilities.contains(feature)
    }
}

/// Constraints for one selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Preferred region.
    pub region: Option<String>,
    /// Region to avoid.
    pub exclude_region: Option<String>,
    /// Capability the node must advertise.
    pub feature: Option<String>,
    /// Regions a caller has already tried and does not want again.
    pub attempted_regions: HashSet<String>,
}

fn is_candidate(node: &NodeSnapshot, feature: Option<&str>) -> bool {
    node.available && !node.search_only && feature.map_or(true, |f| node.has_capability(f))
}

fn in_attempted(node: &NodeSnapshot, attempted: &HashSet<String>) -> bool {
    node.region.as_ref().map_or(false, |r| attempted.contains(r))
}

/// Region-constrained candidate filter.
///
/// Attempted-region history only applies when a region constraint is
/// present; with no constraints every available candidate passes.
pub fn strict_filter<'a>(
    nodes: &'a [NodeSnapshot],
    criteria: &SelectionCriteria,
) -> Vec<&'a NodeSnapshot> {
    let feature = criteria.feature.as_deref();
    let candidates = nodes.iter().filter(|n| is_candidate(n, feature));

    match (criteria.region.as_deref(), criteria.exclude_region.as_deref()) {
        (Some(wanted), Some(excluded)) => candidates
            .filter(|n| {
                n.region.as_deref() == Some(wanted)
                    && n.region.as_deref() != Some(excluded)
                    && !in_attempted(n, &criteria.attempted_regions)
            })
            .collect(),
        (Some(wanted), None) => candidates
            .filter(|n| {
                n.region.as_deref() == Some(wanted)
                    && !in_attempted(n, &criteria.attempted_regions)
            })
            .collect(),
        (None, Some(excluded)) => candidates
            .filter(|n| {
                n.region.as_deref() != Some(excluded)
                    && !in_attempted(n, &criteria.attempted_regions)
            })
            .collect(),
        (None, None) => candidates.collect(),
    }
}

/// Fallback filter: capability and attempted-region constraints only.
pub fn relaxed_filter<'a>(
    nodes: &'a [NodeSnapshot],
    criteria: &SelectionCriteria,
) -> Vec<&'a NodeSnapshot> {
    let feature = criteria.feature.as_deref();
    nodes
        .iter()
        .filter(|n| is_candidate(n, feature) && !in_attempted(n, &criteria.attempted_regions))
        .collect()
}

/// Picks the least-loaded node satisfying `criteria`.
///
/// Falls back from [`strict_filter`] to [`relaxed_filter`] before giving
/// up. Ties on penalty keep the earliest node in iteration order, which is
/// registry insertion order, so repeated calls over an unchanged snapshot
/// return the same node.
pub fn find_best(nodes: &[NodeSnapshot], criteria: &SelectionCriteria) -> Option<NodeId> {
    let mut candidates = strict_filter(nodes, criteria);
    if candidates.is_empty() {
        candidates = relaxed_filter(nodes, criteria);
    }

    let mut best: Option<&NodeSnapshot> = None;
    for node in candidates {
        match best {
            None => best = Some(node),
            Some(current) if node.penalty < current.penalty => best = Some(node),
            Some(_) => {}
        }
    }
    best.map(|n| n.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u64, region: &str, penalty: f64) -> NodeSnapshot {
        NodeSnapshot {
            id: NodeId(id),
            available: true,
            search_only: false,
            region: Some(region.to_string()),
            penalty,
            capabilities: ["youtube", "http"].iter().map(|s| s.to_string()).collect(),
        }
    }

    fn attempted(regions: &[&str]) -> HashSet<String> {
        regions.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_least_loaded_in_region() {
        let nodes = vec![
            snapshot(1, "us", 5.0),
            snapshot(2, "us", 2.0),
            snapshot(3, "eu", 1.0),
        ];
        let criteria = SelectionCriteria {
            region: Some("us".to_string()),
            ..Default::default()
        };
        assert_eq!(find_best(&nodes, &criteria), Some(NodeId(2)));
    }

    #[test]
    fn test_select_global_minimum_without_constraints() {
        let nodes = vec![
            snapshot(1, "us", 5.0),
            snapshot(2, "us", 2.0),
            snapshot(3, "eu", 1.0),
        ];
        assert_eq!(
            find_best(&nodes, &SelectionCriteria::default()),
            Some(NodeId(3))
        );
    }

    #[test]
    fn test_select_is_deterministic() {
        let nodes = vec![snapshot(1, "us", 2.0), snapshot(2, "eu", 1.0)];
        let criteria = SelectionCriteria::default();
        let first = find_best(&nodes, &criteria);
        for _ in 0..10 {
            assert_eq!(find_best(&nodes, &criteria), first);
        }
    }

    #[test]
    fn test_ties_keep_first_in_insertion_order() {
        let nodes = vec![
            snapshot(1, "us", 1.0),
            snapshot(2, "us", 1.0),
            snapshot(3, "us", 1.0),
        ];
        assert_eq!(
            find_best(&nodes, &SelectionCriteria::default()),
            Some(NodeId(1))
        );
    }

    #[test]
    fn test_unavailable_and_search_only_nodes_are_skipped() {
        let mut offline = snapshot(1, "us", 0.0);
        offline.available = false;
        let mut search = snapshot(2, "us", 0.0);
        search.search_only = true;
        let nodes = vec![offline, search, snapshot(3, "us", 9.0)];
        assert_eq!(
            find_best(&nodes, &SelectionCriteria::default()),
            Some(NodeId(3))
        );
    }

    #[test]
    fn test_capability_filter_narrows_candidates() {
        let mut no_http = snapshot(1, "us", 0.0);
        no_http.capabilities.remove("http");
        let nodes = vec![no_http, snapshot(2, "us", 9.0)];
        let criteria = SelectionCriteria {
            feature: Some("http".to_string()),
            ..Default::default()
        };
        assert_eq!(find_best(&nodes, &criteria), Some(NodeId(2)));
    }

    #[test]
    fn test_missing_capability_everywhere_yields_none() {
        let nodes = vec![snapshot(1, "us", 0.0), snapshot(2, "eu", 1.0)];
        let criteria = SelectionCriteria {
            region: Some("eu".to_string()),
            feature: Some("gcloud-tts".to_string()),
            ..Default::default()
        };
        assert_eq!(find_best(&nodes, &criteria), None);
    }

    #[test]
    fn test_relaxation_crosses_regions() {
        // Strict region filter is empty, but a capable node exists elsewhere.
        let nodes = vec![snapshot(1, "us", 5.0), snapshot(2, "us", 2.0)];
        let criteria = SelectionCriteria {
            region: Some("eu".to_string()),
            feature: Some("http".to_string()),
            ..Default::default()
        };
        assert_eq!(find_best(&nodes, &criteria), Some(NodeId(2)));
    }

    #[test]
    fn test_exclude_region_filter() {
        let nodes = vec![snapshot(1, "us", 1.0), snapshot(2, "eu", 5.0)];
        let criteria = SelectionCriteria {
            exclude_region: Some("us".to_string()),
            ..Default::default()
        };
        assert_eq!(find_best(&nodes, &criteria), Some(NodeId(2)));
    }

    #[test]
    fn test_region_and_exclude_region_combined() {
        let nodes = vec![
            snapshot(1, "us", 1.0),
            snapshot(2, "eu", 5.0),
            snapshot(3, "eu", 3.0),
        ];
        let criteria = SelectionCriteria {
            region: Some("eu".to_string()),
            exclude_region: Some("us".to_string()),
            ..Default::default()
        };
        assert_eq!(find_best(&nodes, &criteria), Some(NodeId(3)));
    }

    #[test]
    fn test_attempted_regions_skip_with_region_filter() {
        let nodes = vec![snapshot(1, "us", 1.0), snapshot(2, "eu", 5.0)];
        let criteria = SelectionCriteria {
            region: Some("us".to_string()),
            attempted_regions: attempted(&["us"]),
            ..Default::default()
        };
        // "us" was already tried, so the strict pass is empty and the
        // relaxed pass also skips it.
        assert_eq!(find_best(&nodes, &criteria), Some(NodeId(2)));
    }

    #[test]
    fn test_attempted_regions_ignored_without_region_filter() {
        let nodes = vec![snapshot(1, "us", 1.0), snapshot(2, "eu", 5.0)];
        let criteria = SelectionCriteria {
            attempted_regions: attempted(&["us"]),
            ..Default::default()
        };
        // History exclusion only applies when a region constraint is active.
        assert_eq!(
            strict_filter(&nodes, &criteria).len(),
            2,
            "strict filter must not apply history without a region constraint"
        );
        assert_eq!(find_best(&nodes, &criteria), Some(NodeId(1)));
    }

    #[test]
    fn test_every_region_attempted_yields_none() {
        let nodes = vec![snapshot(1, "us", 1.0), snapshot(2, "eu", 5.0)];
        let criteria = SelectionCriteria {
            region: Some("us".to_string()),
            attempted_regions: attempted(&["us", "eu"]),
            ..Default::default()
        };
        assert_eq!(find_best(&nodes, &criteria), None);
    }

    #[test]
    fn test_no_available_nodes_yields_none() {
        let mut a = snapshot(1, "us", 1.0);
        a.available = false;
        let mut b = snapshot(2, "eu", 2.0);
        b.available = false;
        assert_eq!(find_best(&[a, b], &SelectionCriteria::default()), None);
        assert_eq!(find_best(&[], &SelectionCriteria::default()), None);
    }

    #[test]
    fn test_minimality_over_filtered_set() {
        let nodes = vec![
            snapshot(1, "us", 4.0),
            snapshot(2, "us", 3.0),
            snapshot(3, "us", 7.0),
        ];
        let criteria = SelectionCriteria {
            region: Some("us".to_string()),
            ..Default::default()
        };
        let best = find_best(&nodes, &criteria).unwrap();
        let best_penalty = nodes.iter().find(|n| n.id == best).unwrap().penalty;
        for candidate in strict_filter(&nodes, &criteria) {
            assert!(best_penalty <= candidate.penalty);
        }
    }

    #[test]
    fn test_nodes_without_region_pass_exclusion_filters() {
        let mut regionless = snapshot(1, "us", 1.0);
        regionless.region = None;
        let nodes = vec![regionless, snapshot(2, "eu", 5.0)];
        let criteria = SelectionCriteria {
            exclude_region: Some("us".to_string()),
            attempted_regions: attempted(&["eu"]),
            ..Default::default()
        };
        // No region label means nothing to exclude on.
        assert_eq!(find_best(&nodes, &criteria), Some(NodeId(1)));
    }
}
