//! Sea-ORM entities for the deployment tables.

pub mod deployment;
pub mod deployment_device;
pub mod deployment_log;

pub use deployment::Entity as Deployment;
pub use deployment_device::Entity as DeploymentDevice;
pub use deployment_log::Entity as DeploymentLog;
