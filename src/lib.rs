pub mod batch;
pub mod chem;
pub mod config;
pub mod domain;
pub mod error;
pub mod external;
pub mod formats;
pub mod ledger;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod store;
pub mod tables;
pub mod threshold;
pub mod verify;
