//! Registry statistics

use serde::Serialize;

/// Connection counts at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub open_connections: usize,
    pub pending_connections: usize,
    pub authenticated_connections: usize,
    pub max_connections: usize,
}
