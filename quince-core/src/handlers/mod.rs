//! Nonlinear handlers: the open extension point of the engine. A handler claims capabilities on
//! expression nodes during detection and is afterwards consulted for interval evaluation,
//! reverse propagation, estimation, and enforcement on the nodes it claimed.

mod default_handler;
pub(crate) mod detector;
mod handler;
mod registry;

pub use default_handler::DefaultHandler;
pub use handler::Capability;
pub use handler::EnforcementRecord;
pub use handler::EstimateOutcome;
pub use handler::Estimator;
pub use handler::HandlerClaim;
pub use handler::HandlerId;
pub use handler::NlHandlerExprData;
pub use handler::NonlinearHandler;
pub use registry::HandlerCallback;
pub use registry::HandlerRegistry;
pub use registry::HandlerStatistics;

pub(crate) use default_handler::child_value;
