pub const ROUTE_INDEX: &str = "/";
pub const ROUTE_SENSORS: &str = "/api/sensors";
pub const ROUTE_READINGS: &str = "/api/readings";
