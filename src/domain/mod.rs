pub mod bandit;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod order;
pub mod ports;
pub mod position;
pub mod signal;
pub mod task;
pub mod token_profile;
