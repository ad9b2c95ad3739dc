//! End-to-end scenarios for the master and slave tiers

pub mod end_to_end;
pub mod flap_test;
pub mod http_test;
