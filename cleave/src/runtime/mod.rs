pub mod conf;
pub mod conf_serde;
pub mod reload;
