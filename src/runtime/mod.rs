pub mod client;
pub mod docker;
#[cfg(test)]
pub mod fake;

pub use client::{Attached, BindMount, ContainerRuntime, ContainerSpec, Inspection, MountMode};
pub use docker::DockerRuntime;
