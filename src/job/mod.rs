pub mod handle;
pub mod record;
pub mod registry;

pub use handle::JobHandle;
pub use record::{JobRecord, JobType};
pub use registry::{DefineOptions, JobDefinition, JobHandler, JobRegistry};
