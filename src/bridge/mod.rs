pub mod audit;
pub mod config;
pub mod driver;
pub mod entry;
pub mod export;
pub mod paths;
pub mod receiver;
pub mod reconcile;
pub mod store;
pub mod util;
pub mod warn;
