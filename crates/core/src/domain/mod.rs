pub mod link;
pub mod message;
pub mod party;
pub mod principal;
pub mod property;
