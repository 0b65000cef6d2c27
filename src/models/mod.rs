pub mod analytics;
pub mod approval;
pub mod audit;
pub mod policy;
