//! Contract for structured entities synchronized as whole snapshots.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// An entity edited as a whole object and persisted as one JSON snapshot.
///
/// `apply` must either fully apply the mutation or leave `self` untouched
/// and return an error.
pub trait StructuredEntity:
    Clone + Default + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Mutation: Debug + Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short name used in log lines.
    const KIND: &'static str;

    fn apply(&mut self, mutation: Self::Mutation) -> Result<(), Self::Error>;

    fn to_snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn from_snapshot(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
