//! Voice-region labels and endpoint resolution.

/// Region labels a voice endpoint hostname can start with.
pub const KNOWN_REGIONS: &[&str] = &[
    "amsterdam",
    "brazil",
    "bucharest",
    "buenos-aires",
    "dubai",
    "finland",
    "frankfurt",
    "hongkong",
    "india",
    "japan",
    "london",
    "madrid",
    "milan",
    "montreal",
    "newark",
    "rotterdam",
    "russia",
    "santa-clara",
    "santiago",
    "seattle",
    "singapore",
    "south-korea",
    "southafrica",
    "stockholm",
    "sydney",
    "tel-aviv",
    "us-central",
    "us-east",
    "us-south",
    "us-west",
    "warsaw",
];

/// Derives a region label from a node host or voice endpoint.
///
/// Endpoints may carry a `vip-` prefix; it is stripped before matching.
pub fn region_from_endpoint(endpoint: &str) -> Option<&'static str> {
    let endpoint = endpoint.strip_prefix("vip-").unwrap_or(endpoint);
    KNOWN_REGIONS
        .iter()
        .copied()
        .find(|region| endpoint.starts_with(region))
}
