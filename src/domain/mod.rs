pub mod account;
pub mod action;
pub mod invoice;
pub mod msats;
pub mod payin;
pub mod ports;
