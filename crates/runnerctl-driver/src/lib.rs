pub mod aws;
pub mod driver;
pub mod error;
pub mod local;
pub mod registry;

pub use aws::{AwsDriver, AwsDriverConfig};
pub use driver::{
    AccountValidation, Driver, IpStatus, KeypairMaterial, SshOutput, TerminationOutcome,
};
pub use error::DriverError;
pub use local::LocalDriver;
pub use registry::DriverRegistry;
