pub mod audit;
pub mod rule;
pub mod token;
