//! Pure translation from a deployment spec to backend-native definitions.

pub mod capacity;
pub mod docker;
pub mod endpoints;
pub mod environment;
pub mod ids;
pub mod image;
pub mod kube;
pub mod labels;
