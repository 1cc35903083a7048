mod axis;
mod dtype;
mod lr;
mod optimizer;
mod rng;

pub use axis::{AxisContext, AxisMapping, LogicalAxis, MappingGuard, MeshConfig};
pub use dtype::{DType, PrecisionPolicy, PrecisionPolicyError};
pub use lr::LearningRateSchedule;
pub use optimizer::OptimizerDefinition;
pub use rng::RngKey;
