pub mod alert;
pub mod device;
pub mod job;
pub mod parameter;
pub mod rule;
pub mod tenant;
pub mod user;
