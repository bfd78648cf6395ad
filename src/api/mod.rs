//! API layer - operational HTTP endpoints.

mod health;
mod metrics;
mod room;
mod routes;

pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use room::{get_session, room_members};
pub use routes::api_routes;
