pub mod audit;
pub mod metrics;
pub mod rbac;
