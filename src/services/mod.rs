//! Pipeline stages, the object store gateways and the two orchestrators.

pub mod backup_service;
pub mod ceph;
pub mod cluster;
pub mod compression;
pub mod control;
pub mod gpg;
pub mod local_store;
pub mod object_store;
pub mod process;
pub mod resolver;
pub mod restore_service;
pub mod s3_store;
pub mod scratch;
