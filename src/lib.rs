pub mod accessions;
pub mod catalog;
pub mod collection;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod hits;
pub mod lineage;
pub mod output;
pub mod partition;
pub mod relation;
pub mod run;
pub mod tools;
