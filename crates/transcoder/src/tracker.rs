use std::fmt;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use crate::error::TrackerError;
use crate::job::FinalStatus;
use crate::profile::ResolutionProfile;

/// Lifecycle of one profile within one job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ProfileStatus {
    /// COMPLETED and FAILED never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, ProfileStatus::Completed | ProfileStatus::Failed)
    }
}

/// Progress of one profile, serialized as `{progress, status, error}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileProgress {
    #[serde(rename = "progress")]
    pub percent: u8,
    pub status: ProfileStatus,
    pub error: Option<String>,
}

impl ProfileProgress {
    fn queued() -> Self {
        Self {
            percent: 0,
            status: ProfileStatus::Queued,
            error: None,
        }
    }
}

/// Job-level status derived from the per-profile entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Queued,
    Running,
    Completed,
    PartialSuccess,
    Failed,
}

/// Per-job progress state: an ordered map from profile name to its progress.
///
/// Owned by the orchestrator running the job; readers only ever get clones
/// (see [`JobProgressTracker::snapshot`]). Serializes as a JSON object whose
/// keys follow the profile table order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobProgressTracker {
    entries: Vec<(String, ProfileProgress)>,
}

impl JobProgressTracker {
    /// Seed every profile as QUEUED at 0%
    pub fn new(profiles: &[ResolutionProfile]) -> Self {
        Self {
            entries: profiles
                .iter()
                .map(|p| (p.name.clone(), ProfileProgress::queued()))
                .collect(),
        }
    }

    pub fn get(&self, profile: &str) -> Option<&ProfileProgress> {
        self.entries
            .iter()
            .find(|(name, _)| name == profile)
            .map(|(_, progress)| progress)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProfileProgress)> {
        self.entries.iter().map(|(name, progress)| (name.as_str(), progress))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, profile: &str) -> Result<&mut ProfileProgress, TrackerError> {
        self.entries
            .iter_mut()
            .find(|(name, _)| name == profile)
            .map(|(_, progress)| progress)
            .ok_or_else(|| TrackerError::UnknownProfile(profile.to_string()))
    }

    /// QUEUED -> RUNNING
    pub fn mark_running(&mut self, profile: &str) -> Result<(), TrackerError> {
        let entry = self.entry_mut(profile)?;
        if entry.status != ProfileStatus::Queued {
            return Err(TrackerError::InvalidTransition {
                profile: profile.to_string(),
                from: entry.status,
                to: ProfileStatus::Running,
            });
        }
        entry.status = ProfileStatus::Running;
        Ok(())
    }

    /// Record a new percent for a RUNNING profile.
    ///
    /// Returns `true` only when the stored value increased. Equal values are
    /// deduplicated and lower values dropped, so the published sequence for a
    /// profile is strictly increasing.
    pub fn update(&mut self, profile: &str, percent: u8) -> Result<bool, TrackerError> {
        let entry = self.entry_mut(profile)?;
        if entry.status != ProfileStatus::Running {
            return Err(TrackerError::NotRunning {
                profile: profile.to_string(),
                status: entry.status,
            });
        }

        let percent = percent.min(100);
        if percent <= entry.percent {
            return Ok(false);
        }
        entry.percent = percent;
        Ok(true)
    }

    /// RUNNING -> COMPLETED, percent forced to 100
    pub fn mark_completed(&mut self, profile: &str) -> Result<(), TrackerError> {
        let entry = self.entry_mut(profile)?;
        if entry.status != ProfileStatus::Running {
            return Err(TrackerError::InvalidTransition {
                profile: profile.to_string(),
                from: entry.status,
                to: ProfileStatus::Completed,
            });
        }
        entry.status = ProfileStatus::Completed;
        entry.percent = 100;
        entry.error = None;
        Ok(())
    }

    /// QUEUED/RUNNING -> FAILED, keeping the last observed percent
    pub fn mark_failed(&mut self, profile: &str, error: impl Into<String>) -> Result<(), TrackerError> {
        let entry = self.entry_mut(profile)?;
        if entry.status.is_terminal() {
            return Err(TrackerError::InvalidTransition {
                profile: profile.to_string(),
                from: entry.status,
                to: ProfileStatus::Failed,
            });
        }
        entry.status = ProfileStatus::Failed;
        entry.error = Some(error.into());
        Ok(())
    }

    /// Fail every profile that has not reached a terminal status
    pub fn fail_unfinished(&mut self, error: &str) {
        for (_, entry) in self.entries.iter_mut() {
            if !entry.status.is_terminal() {
                entry.status = ProfileStatus::Failed;
                entry.error = Some(error.to_string());
            }
        }
    }

    /// Immutable copy safe to hand to the transport layer
    pub fn snapshot(&self) -> JobProgressTracker {
        self.clone()
    }

    /// Equal-weight integer mean of per-profile percents, 0 when empty
    pub fn overall_percent(&self) -> u8 {
        if self.entries.is_empty() {
            return 0;
        }
        let sum: u32 = self.entries.iter().map(|(_, p)| p.percent as u32).sum();
        (sum / self.entries.len() as u32) as u8
    }

    /// Final classification, available once every profile is terminal
    pub fn final_status(&self) -> Option<FinalStatus> {
        if self.entries.is_empty() || !self.entries.iter().all(|(_, p)| p.status.is_terminal()) {
            return None;
        }

        let failed = self.count(ProfileStatus::Failed);
        Some(if failed == self.entries.len() {
            FinalStatus::Failed
        } else if failed > 0 {
            FinalStatus::PartialSuccess
        } else {
            FinalStatus::Completed
        })
    }

    pub fn overall_status(&self) -> OverallStatus {
        if let Some(final_status) = self.final_status() {
            return match final_status {
                FinalStatus::Completed => OverallStatus::Completed,
                FinalStatus::PartialSuccess => OverallStatus::PartialSuccess,
                FinalStatus::Failed => OverallStatus::Failed,
            };
        }
        if self.count(ProfileStatus::Queued) == self.entries.len() {
            OverallStatus::Queued
        } else {
            OverallStatus::Running
        }
    }

    pub fn count(&self, status: ProfileStatus) -> usize {
        self.entries.iter().filter(|(_, p)| p.status == status).count()
    }

    /// Names of COMPLETED profiles in table order
    pub fn completed_profiles(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, p)| p.status == ProfileStatus::Completed)
            .map(|(name, _)| name)
            .collect()
    }

    /// (name, error) of FAILED profiles in table order
    pub fn failed_profiles(&self) -> Vec<(&str, &str)> {
        self.iter()
            .filter(|(_, p)| p.status == ProfileStatus::Failed)
            .map(|(name, p)| (name, p.error.as_deref().unwrap_or("unknown error")))
            .collect()
    }
}

impl Serialize for JobProgressTracker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, progress) in &self.entries {
            map.serialize_entry(name, progress)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for JobProgressTracker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TrackerVisitor;

        impl<'de> Visitor<'de> for TrackerVisitor {
            type Value = JobProgressTracker;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of profile name to progress")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, ProfileProgress)> = Vec::new();
                while let Some((name, progress)) = access.next_entry::<String, ProfileProgress>()? {
                    if entries.iter().any(|(existing, _)| *existing == name) {
                        return Err(serde::de::Error::custom(format!("duplicate profile {}", name)));
                    }
                    if progress.percent > 100 {
                        return Err(serde::de::Error::custom(format!(
                            "profile {} progress {} out of range",
                            name, progress.percent
                        )));
                    }
                    entries.push((name, progress));
                }
                Ok(JobProgressTracker { entries })
            }
        }

        deserializer.deserialize_map(TrackerVisitor)
    }
}
