//! Request admission: tier resolution, rate limiting, caching and forwarding.

mod context;
mod forward;
mod pipeline;
mod request;
mod resolver;

pub use context::GatewayContext;
pub use forward::{EchoForwarder, ForwardRequest, ForwardResponse, Forwarder};
pub use pipeline::{
    Admission, ComponentHealth, Gateway, HealthReport, PipelineSettings, ResponseSource,
    ServedResponse,
};
pub use request::{Fingerprint, InboundRequest, Method};
pub use resolver::{StaticTierResolver, TierResolver};
