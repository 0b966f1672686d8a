pub mod client;
pub mod resources;

pub use client::{ClusterClient, JobClient, KubeClusterClient, KubeJobClient};
