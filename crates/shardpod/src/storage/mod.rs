pub mod local_pods;
pub mod memory;
pub mod noop_health;
pub mod noop_pods;
