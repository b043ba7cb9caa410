use serde::{Deserialize, Serialize};

/// One target output of a job: a unique name and the geometry handed to the
/// encoder's scale filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionProfile {
    pub name: String,
    pub scale_spec: String,
}

impl ResolutionProfile {
    pub fn new(name: impl Into<String>, scale_spec: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scale_spec: scale_spec.into(),
        }
    }
}

/// Process-wide profile table. Order is the processing order.
/// `-2` keeps the source aspect ratio with an even width.
const DEFAULT_PROFILES: &[(&str, &str)] = &[
    ("360p", "-2:360"),
    ("720p", "-2:720"),
    ("1080p", "-2:1080"),
];

/// Returns the default resolution profile table in processing order
pub fn default_profiles() -> Vec<ResolutionProfile> {
    DEFAULT_PROFILES
        .iter()
        .map(|(name, scale)| ResolutionProfile::new(*name, *scale))
        .collect()
}

/// Look up a profile by name in the default table
pub fn find_profile(name: &str) -> Option<ResolutionProfile> {
    DEFAULT_PROFILES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(n, scale)| ResolutionProfile::new(*n, *scale))
}

/// Names of the default profiles, in order
pub fn profile_names() -> Vec<&'static str> {
    DEFAULT_PROFILES.iter().map(|(name, _)| *name).collect()
}
